// Service Errors
// Failures surfaced by the scheduler, split by whether redelivery can help

use crate::broker::BrokerError;
use crate::store::StoreError;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Durable state could not be read or written
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Declaring or publishing failed
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Message body does not match the expected shape
    #[error("malformed {kind} message: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file unreadable or out of range
    #[error("configuration error: {0}")]
    Config(String),
}

impl ServiceError {
    pub fn decode(kind: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { kind, source }
    }

    /// Whether the inbound message should be redelivered.
    ///
    /// Store and broker I/O failures are transient. A malformed body fails
    /// the same way on every delivery, so it is dropped.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Store(_) => true,
            ServiceError::Broker(e) => e.is_transient(),
            ServiceError::Decode { .. } | ServiceError::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_transient() {
        let err: ServiceError = StoreError::LockPoisoned.into();
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("store error"));
    }

    #[test]
    fn test_decode_errors_are_not_transient() {
        let source = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err = ServiceError::decode("job-result", source);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("malformed job-result message"));
    }

    #[test]
    fn test_broker_transience_follows_broker() {
        let err: ServiceError = BrokerError::UndeclaredExchange("jobs".to_string()).into();
        assert!(!err.is_transient());

        let err: ServiceError =
            BrokerError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow")).into();
        assert!(err.is_transient());
    }
}
