use thiserror::Error;

/// Typed failure returned by the delivery adapter.
///
/// `Permanent` means the recipient cannot be reached and further retries
/// are pointless (blocked the bot, deleted account, unknown chat).
/// `Transient` means the transport hiccupped; the adapter retries these
/// internally with backoff before surfacing one.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("recipient permanently unreachable: {0}")]
    Permanent(String),
    #[error("transient transport error: {0}")]
    Transient(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Umbrella error for engine and storage operations.
#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error("invalid definition: {0}")]
    Validation(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("malformed {column} column: {source}")]
    BadColumn {
        column: &'static str,
        source: serde_json::Error,
    },
}
