use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use quill_sync::{AccessPolicy, CommentLimits, PresenceConfig};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub presence: PresenceConfig,
    pub reap_interval: Duration,
    pub limits: CommentLimits,
    pub policy: AccessPolicy,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = get("QUILL_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("QUILL_JWT_SECRET is unset or still a placeholder");
        }

        let presence = PresenceConfig {
            heartbeat_interval: Duration::from_secs(parse_or(&get, "QUILL_HEARTBEAT_SECS", 10)?),
            max_missed_heartbeats: parse_or(&get, "QUILL_MAX_MISSED_HEARTBEATS", 3)?,
        };
        presence.validate()?;

        let limits = CommentLimits {
            max_body_chars: parse_or(&get, "QUILL_MAX_COMMENT_CHARS", 1000)?,
        };
        limits.validate()?;

        let reap_interval = Duration::from_secs(parse_or(&get, "QUILL_REAP_INTERVAL_SECS", 5)?);
        if reap_interval.is_zero() {
            bail!("QUILL_REAP_INTERVAL_SECS must be greater than zero");
        }

        let policy = if parse_or(&get, "QUILL_REQUIRE_LOGIN", false)? {
            AccessPolicy::require_login()
        } else {
            AccessPolicy::Open
        };

        Ok(Self {
            host: get("QUILL_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "QUILL_PORT", 3000)?,
            db_path: get("QUILL_DB_PATH").unwrap_or_else(|| "quill.db".into()).into(),
            jwt_secret,
            presence,
            reap_interval,
            limits,
            policy,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
