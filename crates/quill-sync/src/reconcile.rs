use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use quill_types::CommentId;
use quill_types::models::{Comment, CommentUpdate};

type OrderKey = (DateTime<Utc>, CommentId);

/// `Empty` until the first authoritative data arrives, then `Populated` for
/// good. An empty comment set from the store is still data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Empty,
    Populated,
}

/// The ordered, deduplicated comment list of one post.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentList {
    state: StreamState,
    version: u64,
    ordered: BTreeMap<OrderKey, Comment>,
    index: HashMap<CommentId, OrderKey>,
}

impl CommentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A populated list seeded from snapshot data.
    pub fn from_snapshot(version: u64, comments: impl IntoIterator<Item = Comment>) -> Self {
        let mut list = Self {
            state: StreamState::Populated,
            version,
            ..Self::default()
        };
        for comment in comments {
            list.insert(comment);
        }
        list
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Highest backend sequence number folded into this list.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn contains(&self, id: &CommentId) -> bool {
        self.index.contains_key(id)
    }

    /// Comments in render order.
    pub fn iter(&self) -> impl Iterator<Item = &Comment> {
        self.ordered.values()
    }

    pub fn ids(&self) -> Vec<CommentId> {
        self.ordered.keys().map(|(_, id)| *id).collect()
    }

    pub fn to_vec(&self) -> Vec<Comment> {
        self.ordered.values().cloned().collect()
    }

    /// Fold an update in place. Returns whether the rendered output changed.
    ///
    /// A `Replace` older than what is already folded in is merged like an
    /// `Append` instead, since comments are never deleted upstream and a stale
    /// full set must not drop newer ones.
    pub fn apply(&mut self, update: &CommentUpdate) -> bool {
        let mut changed = self.state != StreamState::Populated;
        self.state = StreamState::Populated;

        match update {
            CommentUpdate::Replace { version, comments } if *version >= self.version => {
                let fresh = Self::from_snapshot(*version, comments.iter().cloned());
                if fresh.ordered != self.ordered {
                    self.ordered = fresh.ordered;
                    self.index = fresh.index;
                    changed = true;
                }
            }
            _ => {
                for comment in update.comments() {
                    changed |= self.insert(comment.clone());
                }
            }
        }

        self.version = self.version.max(update.version());
        changed
    }

    fn insert(&mut self, comment: Comment) -> bool {
        let key = comment.order_key();
        if let Some(existing) = self.index.get(&comment.id).copied() {
            if existing == key && self.ordered.get(&existing) == Some(&comment) {
                return false;
            }
            self.ordered.remove(&existing);
        }
        self.index.insert(comment.id, key);
        self.ordered.insert(key, comment);
        true
    }
}

/// Pure form of [`CommentList::apply`]: the list after `update`.
pub fn reconcile(current: &CommentList, update: &CommentUpdate) -> CommentList {
    let mut next = current.clone();
    next.apply(update);
    next
}
