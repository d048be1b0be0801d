//! OMEMO end-to-end encryption for XMPP clients.
//!
//! [`OmemoManager`] owns this device's key material and the sessions with
//! every known device of the own account and of contacts. It encrypts stanza
//! content once and wraps the content key for every accepted device, and it
//! keeps itself healthy by replenishing pre-keys, renewing signed pre-keys,
//! probing silent devices and forgetting devices that left their owner's
//! device list.
//!
//! The double ratchet itself, trust decisions, the PEP directory and stanza
//! delivery are collaborators behind the [`RatchetEngine`], [`TrustGate`],
//! [`DeviceDirectory`] and [`StanzaSender`] traits.

pub mod config;
pub mod content;
mod decryption;
pub mod device_lists;
pub mod device_registry;
pub mod directory;
mod encryption;
pub mod error;
pub mod key_material;
pub mod omemo_storage;
pub mod payload;
pub mod pubsub;
pub mod ratchet;
pub mod scheduler;
pub mod sender;
pub mod session_manager;
pub mod storage;
pub mod trust;
pub mod types;
pub mod utils;

pub use config::OmemoConfig;
pub use content::ContentEnvelope;
pub use device_lists::DeviceListEvent;
pub use device_registry::{DeviceRegistry, ExpiredDevice, RemoteDevice};
pub use directory::{DeviceDirectory, PepDirectory};
pub use error::{DecryptError, EncryptError, Error, Result};
pub use key_material::{KeyMaterialStore, OwnDevice, PreKeyPair, SignedPreKeyPair};
pub use omemo_storage::{OmemoData, OmemoStorage};
pub use payload::{EncryptedPayload, PayloadCipher};
pub use pubsub::{ItemLimit, NodeConfig, PepFeatures, PubSubItem, PubSubService};
pub use ratchet::{
    EncryptedMessage, GeneratedPreKey, GeneratedSignedPreKey, IdentityKeyPair, IdentityKeyStore,
    KeyExchangeDecryption, PreKeyStore, ProtocolAddress, RatchetEngine, RatchetStores,
    SessionBundle, SessionStore, SignedPreKeyStore,
};
pub use scheduler::LifecycleScheduler;
pub use sender::{OutgoingMessage, StanzaSender};
pub use session_manager::{OmemoManager, OmemoServices};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use trust::{MemoryTrustStore, SecurityPolicy, TrustGate, TrustLevel, TrustLevels};
pub use types::*;
