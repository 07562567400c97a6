use thiserror::Error;

use trustmesh_types::TrustmeshError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Connection {0} lost")]
    ConnectionLost(u64),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Delivery {delivery_tag} unconfirmed: connection dropped before the broker answered")]
    Unconfirmed { delivery_tag: u64 },

    #[error("Delivery {delivery_tag} rejected by the broker")]
    Nacked { delivery_tag: u64 },

    #[error("Delivery {delivery_tag} not confirmed within {timeout_ms} ms")]
    ConfirmTimeout { delivery_tag: u64, timeout_ms: u64 },

    #[error("Channel leases exhausted ({in_use}/{capacity} in use)")]
    LeaseExhausted { in_use: usize, capacity: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Channel manager is shut down")]
    Closed,
}

impl BrokerError {
    /// Broker- and network-level failures are always worth retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BrokerError::Unavailable(_)
                | BrokerError::ConnectionLost(_)
                | BrokerError::Channel(_)
                | BrokerError::Unconfirmed { .. }
                | BrokerError::Nacked { .. }
                | BrokerError::ConfirmTimeout { .. }
        )
    }
}

impl From<BrokerError> for TrustmeshError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unconfirmed { delivery_tag } => TrustmeshError::Unconfirmed {
                delivery_tag,
                reason: "connection lost".into(),
            },
            BrokerError::Nacked { delivery_tag } => TrustmeshError::Unconfirmed {
                delivery_tag,
                reason: "nacked by broker".into(),
            },
            BrokerError::ConfirmTimeout {
                delivery_tag,
                timeout_ms,
            } => TrustmeshError::Unconfirmed {
                delivery_tag,
                reason: format!("no confirm within {timeout_ms} ms"),
            },
            BrokerError::LeaseExhausted { in_use, capacity } => {
                TrustmeshError::ResourceExhausted {
                    resource: "channel leases".into(),
                    in_use,
                    capacity,
                }
            }
            BrokerError::Cancelled => TrustmeshError::Cancelled("broker operation".into()),
            BrokerError::Closed => TrustmeshError::BrokerUnavailable("shut down".into()),
            other => TrustmeshError::BrokerUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustmesh_types::ErrorClass;

    #[test]
    fn test_conversion_keeps_error_class() {
        let err: TrustmeshError = BrokerError::Nacked { delivery_tag: 7 }.into();
        assert_eq!(err.class(), ErrorClass::Transient);

        let err: TrustmeshError = BrokerError::LeaseExhausted {
            in_use: 16,
            capacity: 16,
        }
        .into();
        assert_eq!(err.class(), ErrorClass::Resource);

        let err: TrustmeshError = BrokerError::Unavailable("refused".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_recoverable() {
        assert!(BrokerError::ConnectionLost(1).is_recoverable());
        assert!(!BrokerError::Cancelled.is_recoverable());
        assert!(!BrokerError::LeaseExhausted { in_use: 1, capacity: 1 }.is_recoverable());
    }
}
