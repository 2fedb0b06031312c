//! Billing error types

use uuid::Uuid;

use crate::gateway::GatewayError;
use crate::signature::VerificationError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Webhook verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("Billing provider error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(Uuid),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Subscriber {subscriber_id} still contended after {attempts} commit attempts")]
    CommitContention { subscriber_id: Uuid, attempts: u32 },

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            // Constraint violations repeat on every retry
            sqlx::Error::Database(db) if db.is_unique_violation() || db.is_check_violation() => {
                BillingError::InvalidState(e.to_string())
            }
            _ => BillingError::Database(e.to_string()),
        }
    }
}

impl BillingError {
    /// Whether a later retry of the same work can succeed.
    ///
    /// The webhook endpoint answers transient errors with a 5xx so the
    /// provider redelivers; everything else is terminal for that request.
    pub fn is_transient(&self) -> bool {
        match self {
            BillingError::Database(_)
            | BillingError::CommitContention { .. }
            | BillingError::Internal(_) => true,
            BillingError::Gateway(e) => e.is_transient(),
            BillingError::Verification(_)
            | BillingError::SubscriberNotFound(_)
            | BillingError::InvalidState(_)
            | BillingError::InvalidInput(_)
            | BillingError::CorruptRecord(_)
            | BillingError::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failures_are_transient() {
        assert!(BillingError::Database("connection reset".into()).is_transient());
        assert!(BillingError::CommitContention {
            subscriber_id: Uuid::new_v4(),
            attempts: 5
        }
        .is_transient());
        assert!(BillingError::from(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn test_data_problems_are_terminal() {
        assert!(!BillingError::CorruptRecord("unknown plan 'gold'".into()).is_transient());
        assert!(!BillingError::InvalidState("attempt_count out of range".into()).is_transient());
    }

    #[test]
    fn test_verification_failures_are_terminal() {
        let err = BillingError::from(VerificationError::SignatureMismatch);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_gateway_transience_is_preserved() {
        assert!(BillingError::from(GatewayError::Transient("503".into())).is_transient());
        assert!(!BillingError::from(GatewayError::Permanent("bad price".into())).is_transient());
    }
}
