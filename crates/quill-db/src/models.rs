/// SQLite row types. Ids and timestamps stay as stored strings; the gateway
/// store turns them into quill-types models.
/// Distinct from quill-types models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password: String,
    pub created_at: String,
}

pub struct PostRow {
    pub id: String,
    pub author_id: String,
    pub title: String,
    pub body: String,
    pub image_url: Option<String>,
    pub created_at: String,
}

pub struct CommentRow {
    pub id: String,
    pub post_id: String,
    pub seq: i64,
    pub author_id: String,
    pub author_name: String,
    pub body: String,
    pub created_at: String,
}
