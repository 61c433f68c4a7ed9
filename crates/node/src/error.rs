//! Error kinds surfaced by the node's sub-protocols. None of them abort a
//! cycle; each component degrades to a safe default and the controller
//! decides what happens next. Only a reconnect timeout escalates.

use thiserror::Error;

/// One HTTP exchange failed at the transport level (DNS, connect, timeout,
/// non-success status).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {host} failed: {reason}")]
    Request { host: String, reason: String },

    #[error("{host} answered HTTP {status}")]
    Status { host: String, status: u16 },

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Fetching the remote configuration feed failed as a whole.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed config payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("config feed is empty")]
    EmptyFeed,
}

/// A single upload attempt did not get through.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The sink answered `0`: rate limited or bad key.
    #[error("sink rejected the update")]
    Rejected,
}

/// A single sensor measurement failed. Dropped by the sampler, never fatal.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor did not respond")]
    NoResponse,

    #[error("checksum mismatch: got {got:#04x}, expected {expected:#04x}")]
    Checksum { got: u8, expected: u8 },

    #[error("measurement incomplete")]
    Incomplete,

    #[error("sensor is not powered")]
    Unpowered,
}

/// Delivering a message to the messaging sink failed or was refused.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("messaging disabled (no bot token or chat id)")]
    Disabled,

    #[error("refusing to send an empty message")]
    EmptyMessage,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The network layer could not be brought up within its bound. The node
/// answers this with a hard reset.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network not connected after {waited_secs}s")]
    ReconnectTimeout { waited_secs: u64 },
}

/// Why a cycle stopped short of its sleep/loop decision.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Network(#[from] NetworkError),
}
