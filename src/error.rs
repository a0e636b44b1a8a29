use thiserror::Error;

/// Errors surfaced by the execution subsystem.
///
/// Handler-level failures (a node action that fails) are NOT errors at this
/// level; they are recorded on the task row and the event is still committed.
/// `EngineError` covers the infrastructure underneath.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("mail build error: {0}")]
    MailBuild(#[from] lettre::error::Error),

    #[error("mailbox error: {0}")]
    Mailbox(#[from] imap::Error),

    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("credential not found: {platform} for user {user_id}")]
    CredentialNotFound { platform: String, user_id: uuid::Uuid },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// The "schema not provisioned yet" class of store errors (e.g. the
    /// outbox table is selected before migrations ran). A startup race,
    /// not a fatal condition.
    pub fn is_missing_relation(&self) -> bool {
        match self {
            EngineError::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some("42P01")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_relation_only_matches_undefined_table() {
        let err = EngineError::Config("bad".into());
        assert!(!err.is_missing_relation());

        let err = EngineError::Database(sqlx::Error::RowNotFound);
        assert!(!err.is_missing_relation());
    }
}
