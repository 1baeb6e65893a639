//! Proof couriers: the out-of-band transport that carries a sealed proof
//! file from the sender to a receiver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use portage_core::{AssetId, SerializedKey};

use crate::archive::AnnotatedProof;
use crate::error::ProofError;

/// Transport protocols a courier address can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CourierProtocol {
    /// Mailbox-style delivery over an intermediate hashmail server.
    Hashmail,
    /// Direct delivery into a universe server over RPC.
    UniverseRpc,
}

impl CourierProtocol {
    /// The URI scheme of the protocol.
    pub fn scheme(&self) -> &'static str {
        match self {
            CourierProtocol::Hashmail => "hashmail",
            CourierProtocol::UniverseRpc => "universerpc",
        }
    }
}

/// A parsed proof courier address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourierAddr {
    /// The delivery protocol.
    pub protocol: CourierProtocol,
    /// Courier server host.
    pub host: String,
    /// Courier server port.
    pub port: u16,
}

impl CourierAddr {
    /// Parse an address of the form `scheme://host:port`.
    pub fn parse(addr: &str) -> Result<Self, ProofError> {
        let (scheme, rest) = addr
            .split_once("://")
            .ok_or_else(|| ProofError::InvalidCourierAddr(format!("missing scheme: {addr}")))?;

        let protocol = match scheme {
            "hashmail" => CourierProtocol::Hashmail,
            "universerpc" => CourierProtocol::UniverseRpc,
            other => {
                return Err(ProofError::InvalidCourierAddr(format!(
                    "unknown protocol: {other}"
                )))
            }
        };

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ProofError::InvalidCourierAddr(format!("missing port: {addr}")))?;
        if host.is_empty() {
            return Err(ProofError::InvalidCourierAddr(format!(
                "missing host: {addr}"
            )));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ProofError::InvalidCourierAddr(format!("invalid port: {addr}")))?;

        Ok(Self {
            protocol,
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for CourierAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

/// The receiver a proof is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Script key the receiver holds the asset under.
    pub script_key: SerializedKey,
    /// The asset being received.
    pub asset_id: AssetId,
    /// Amount of asset units received.
    pub amount: u64,
}

/// Errors returned by a courier delivery attempt.
#[derive(Debug, Clone, Error)]
pub enum CourierError {
    /// The courier is backing off and will retry the delivery on its own;
    /// the caller should not treat the transfer as failed.
    #[error("courier backing off: {0}")]
    Backoff(String),

    /// The delivery failed for good.
    #[error("courier delivery failed: {0}")]
    Fatal(String),
}

/// Kinds of events a courier reports while a delivery is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CourierEventKind {
    /// A delivery attempt is starting.
    DeliveryAttempt {
        /// 1-based attempt counter.
        attempt: u32,
    },
    /// The courier is waiting before the next attempt.
    BackoffWait {
        /// How long the courier will wait.
        wait: Duration,
    },
    /// The proof was handed to the receiver side.
    Delivered,
}

/// An event reported by a courier to its subscribers.
#[derive(Debug, Clone)]
pub struct CourierEvent {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: CourierEventKind,
}

impl CourierEvent {
    /// Create an event stamped with the current time.
    pub fn now(kind: CourierEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// A live courier handle for one recipient.
#[async_trait]
pub trait Courier: Send + Sync {
    /// Replace the set of subscribers that receive courier events.
    fn set_subscribers(&self, subscribers: Vec<mpsc::Sender<CourierEvent>>);

    /// Deliver the given proof to the recipient.
    async fn deliver_proof(&self, proof: &AnnotatedProof) -> Result<(), CourierError>;

    /// Release the courier's resources.
    async fn close(&self);
}

/// Creates courier handles for the protocol named by a courier address.
#[async_trait]
pub trait CourierDispatch: Send + Sync {
    /// Open a courier for the given address and recipient.
    async fn new_courier(
        &self,
        addr: &CourierAddr,
        recipient: Recipient,
    ) -> Result<Arc<dyn Courier>, ProofError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hashmail() {
        let addr = CourierAddr::parse("hashmail://mailbox.example.com:443").unwrap();
        assert_eq!(addr.protocol, CourierProtocol::Hashmail);
        assert_eq!(addr.host, "mailbox.example.com");
        assert_eq!(addr.port, 443);
        assert_eq!(addr.to_string(), "hashmail://mailbox.example.com:443");
    }

    #[test]
    fn test_parse_universe_rpc() {
        let addr = CourierAddr::parse("universerpc://127.0.0.1:10029").unwrap();
        assert_eq!(addr.protocol, CourierProtocol::UniverseRpc);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CourierAddr::parse("mailbox.example.com:443").is_err());
        assert!(CourierAddr::parse("ftp://mailbox.example.com:443").is_err());
        assert!(CourierAddr::parse("hashmail://mailbox.example.com").is_err());
        assert!(CourierAddr::parse("hashmail://:443").is_err());
        assert!(CourierAddr::parse("hashmail://host:notaport").is_err());
    }
}
