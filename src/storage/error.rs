#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid `{column}` value `{value}` in {table}")]
    InvalidColumn {
        table: &'static str,
        column: &'static str,
        value: String,
    },
    #[error("json column encode/decode failed: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
    },
    /// The row was claimed but its stored columns could not be read back.
    #[error("request {id} in {table} was claimed but could not be decoded: {reason}")]
    UndecodableRequest {
        table: &'static str,
        id: i64,
        reason: String,
    },
    #[error("blocking storage task failed: {0}")]
    Join(String),
}
