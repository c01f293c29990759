use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    MalformedCommand(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid sort key: {0}")]
    InvalidSortKey(String),

    #[error("Invalid message set: {0}")]
    InvalidMessageSet(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl MailError {
    /// Whether this error is a grammar violation that IMAP reports as `BAD`
    /// rather than `NO`.
    pub fn is_bad(&self) -> bool {
        matches!(
            self,
            MailError::MalformedCommand(_)
                | MailError::InvalidSortKey(_)
                | MailError::InvalidMessageSet(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MailError>;
