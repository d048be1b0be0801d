use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("OMEMO manager is not started")]
    NotStarted,

    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Ratchet error: {0}")]
    Ratchet(String),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Encrypt(#[from] EncryptError),

    #[error(transparent)]
    Decrypt(#[from] DecryptError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reasons a whole fan-out encryption fails. Per-device failures are only
/// reported through one of these when no device received an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptError {
    #[error("no recipient devices could be found")]
    NoRecipientDevices,

    #[error("no recipient device responded to previously sent stanzas")]
    NoRespondingRecipientDevices,

    #[error("no recipient devices with keys having accepted trust levels")]
    NoAcceptedRecipientDevices,
}

/// Rejection of a single received stanza. None of these is fatal to the
/// session or the manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message has already been received")]
    DuplicateMessage,

    #[error("message uses a deprecated format")]
    LegacyFormat,

    #[error("pre key {0} could not be found locally")]
    UnknownPreKey(u32),

    #[error("identity key is not trusted by the ratchet engine")]
    UntrustedIdentity,

    #[error("no session with the sending device")]
    NoSession,

    #[error("payload authentication failed")]
    InvalidMac,

    #[error("payload could not be decrypted: {0}")]
    InvalidPayload(String),
}

pub type Result<T> = std::result::Result<T, Error>;
