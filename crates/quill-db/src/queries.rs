use crate::Database;
use crate::models::{CommentRow, PostRow, UserRow};
use anyhow::Result;
use rusqlite::{Connection, Row};

/// Outcome of a comment insert. Missing references are reported as values so
/// the caller can classify them without string-matching SQLite errors.
pub enum InsertComment {
    Inserted(CommentRow),
    UnknownPost,
    UnknownAuthor,
}

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, name: &str, email: &str, password_hash: &str, created_at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, password, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, name, email, password_hash, created_at),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Posts --

    pub fn insert_post(
        &self,
        id: &str,
        author_id: &str,
        title: &str,
        body: &str,
        image_url: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO posts (id, author_id, title, body, image_url, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, author_id, title, body, image_url, created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_post(&self, id: &str) -> Result<Option<PostRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, author_id, title, body, image_url, created_at FROM posts WHERE id = ?1",
                [id],
                post_from_row,
            )
            .optional()
        })
    }

    pub fn list_posts(&self, limit: u32) -> Result<Vec<PostRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, author_id, title, body, image_url, created_at
                 FROM posts
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit], post_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Comments --

    /// Insert a comment and hand out the next per-post sequence number.
    pub fn insert_comment(
        &self,
        id: &str,
        post_id: &str,
        author_id: &str,
        body: &str,
        created_at: &str,
    ) -> Result<InsertComment> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let post_exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM posts WHERE id = ?1)",
                [post_id],
                |row| row.get(0),
            )?;
            if !post_exists {
                return Ok(InsertComment::UnknownPost);
            }

            let author_name: Option<String> = tx
                .query_row("SELECT name FROM users WHERE id = ?1", [author_id], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(author_name) = author_name else {
                return Ok(InsertComment::UnknownAuthor);
            };

            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM comments WHERE post_id = ?1",
                [post_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO comments (id, post_id, seq, author_id, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, post_id, seq, author_id, body, created_at],
            )?;
            tx.commit()?;

            Ok(InsertComment::Inserted(CommentRow {
                id: id.to_string(),
                post_id: post_id.to_string(),
                seq,
                author_id: author_id.to_string(),
                author_name,
                body: body.to_string(),
                created_at: created_at.to_string(),
            }))
        })
    }

    /// All comments of a post with a sequence number above `since`, plus the
    /// post's current sequence number. Both are read under one lock so the
    /// version always matches the rows.
    pub fn get_comments_since(&self, post_id: &str, since: i64) -> Result<(i64, Vec<CommentRow>)> {
        self.with_conn(|conn| {
            let version: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM comments WHERE post_id = ?1",
                [post_id],
                |row| row.get(0),
            )?;
            let rows = query_comments(conn, post_id, since)?;
            Ok((version, rows))
        })
    }

    pub fn get_comments(&self, post_id: &str) -> Result<(i64, Vec<CommentRow>)> {
        self.get_comments_since(post_id, 0)
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    // column is one of two fixed identifiers chosen by the callers above
    let sql = format!(
        "SELECT id, name, email, password, created_at FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                password: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_comments(conn: &Connection, post_id: &str, since: i64) -> Result<Vec<CommentRow>> {
    // JOIN users to fetch author_name in a single query (eliminates N+1)
    let mut stmt = conn.prepare(
        "SELECT c.id, c.post_id, c.seq, c.author_id, u.name, c.body, c.created_at
         FROM comments c
         LEFT JOIN users u ON c.author_id = u.id
         WHERE c.post_id = ?1 AND c.seq > ?2
         ORDER BY c.created_at ASC, c.id ASC",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![post_id, since], |row| {
            Ok(CommentRow {
                id: row.get(0)?,
                post_id: row.get(1)?,
                seq: row.get(2)?,
                author_id: row.get(3)?,
                author_name: row.get::<_, Option<String>>(4)?.unwrap_or_else(|| "unknown".to_string()),
                body: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<PostRow> {
    Ok(PostRow {
        id: row.get(0)?,
        author_id: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        image_url: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: &str = "2026-01-01T00:00:00.000000Z";

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "Ada", "ada@example.com", "hash", T0).unwrap();
        db.insert_post("p1", "u1", "Hello", "World", None, T0).unwrap();
        db
    }

    #[test]
    fn comment_seq_is_per_post_and_monotonic() {
        let db = seeded();
        db.insert_post("p2", "u1", "Other", "Post", None, T0).unwrap();

        for (i, post) in ["p1", "p1", "p2", "p1"].iter().enumerate() {
            let id = format!("c{}", i);
            assert!(matches!(
                db.insert_comment(&id, post, "u1", "hi", T0).unwrap(),
                InsertComment::Inserted(_)
            ));
        }

        let (version, rows) = db.get_comments("p1").unwrap();
        assert_eq!(version, 3);
        assert_eq!(rows.len(), 3);

        let (version, rows) = db.get_comments_since("p1", 2).unwrap();
        assert_eq!(version, 3);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "c3");
        assert_eq!(rows[0].author_name, "Ada");

        assert_eq!(db.get_comments("p2").unwrap().0, 1);
    }

    #[test]
    fn insert_reports_missing_references() {
        let db = seeded();
        assert!(matches!(
            db.insert_comment("c1", "nope", "u1", "hi", T0).unwrap(),
            InsertComment::UnknownPost
        ));
        assert!(matches!(
            db.insert_comment("c1", "p1", "ghost", "hi", T0).unwrap(),
            InsertComment::UnknownAuthor
        ));
        let (version, rows) = db.get_comments("p1").unwrap();
        assert_eq!(version, 0);
        assert!(rows.is_empty());
    }

    #[test]
    fn missing_post_is_none() {
        let db = seeded();
        assert!(db.get_post("p1").unwrap().is_some());
        assert!(db.get_post("missing").unwrap().is_none());
        assert!(db.get_user_by_email("ada@example.com").unwrap().is_some());
        assert!(db.get_user_by_id("nobody").unwrap().is_none());
    }
}
