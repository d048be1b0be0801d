//! Seam to the double-ratchet engine.
//!
//! The engine owns the cryptography and no state of its own. Whatever it
//! needs to remember is read from and written to the capability stores
//! passed in with every call.

use crate::Result;
use std::fmt;

/// Address of a remote device as seen by the ratchet engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolAddress {
    pub jid: String,
    pub device_id: u32,
}

impl ProtocolAddress {
    pub fn new(jid: impl Into<String>, device_id: u32) -> Self {
        Self {
            jid: jid.into(),
            device_id,
        }
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.jid, self.device_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityKeyPair {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSignedPreKey {
    pub id: u32,
    /// Serialized key pair, opaque to everything but the engine.
    pub record: Vec<u8>,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedPreKey {
    pub id: u32,
    pub record: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// A remote bundle reduced to the single pre-key chosen for session building.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBundle {
    pub registration_id: u32,
    pub identity_key: Vec<u8>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key: Vec<u8>,
    pub signed_pre_key_signature: Vec<u8>,
    pub pre_key_id: u32,
    pub pre_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub data: Vec<u8>,
    /// Whether the message still carries the key exchange because the peer
    /// has not answered since the session was built.
    pub is_key_exchange: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangeDecryption {
    pub plaintext: Vec<u8>,
    /// Identity key the sender announced in the key exchange.
    pub identity_key: Vec<u8>,
}

pub trait IdentityKeyStore {
    fn identity_key_pair(&self) -> IdentityKeyPair;
    fn local_registration_id(&self) -> u32;
}

pub trait PreKeyStore {
    fn load_pre_key(&self, id: u32) -> Option<Vec<u8>>;
    fn store_pre_key(&mut self, id: u32, record: Vec<u8>) -> Result<()>;
    fn contains_pre_key(&self, id: u32) -> bool;
    /// Called by the engine once a pre-key has been used by a peer.
    fn remove_pre_key(&mut self, id: u32) -> Result<()>;
}

pub trait SignedPreKeyStore {
    fn load_signed_pre_key(&self, id: u32) -> Option<Vec<u8>>;
    fn store_signed_pre_key(&mut self, id: u32, record: Vec<u8>) -> Result<()>;
    fn contains_signed_pre_key(&self, id: u32) -> bool;
    fn remove_signed_pre_key(&mut self, id: u32) -> Result<()>;
}

pub trait SessionStore {
    fn load_session(&self, address: &ProtocolAddress) -> Option<Vec<u8>>;
    fn store_session(&mut self, address: &ProtocolAddress, record: Vec<u8>) -> Result<()>;
    fn contains_session(&self, address: &ProtocolAddress) -> bool;
    fn delete_session(&mut self, address: &ProtocolAddress) -> Result<()>;
    /// Device ids of `jid` with a usable session.
    fn sub_device_sessions(&self, jid: &str) -> Vec<u32>;
}

/// The four capability stores handed to the engine for one call.
pub trait RatchetStores {
    fn identity(&self) -> &dyn IdentityKeyStore;
    fn pre_keys(&mut self) -> &mut dyn PreKeyStore;
    fn signed_pre_keys(&mut self) -> &mut dyn SignedPreKeyStore;
    fn sessions(&mut self) -> &mut dyn SessionStore;
}

pub trait RatchetEngine: Send + Sync {
    fn generate_identity_key_pair(&self) -> Result<IdentityKeyPair>;

    fn generate_signed_pre_key(
        &self,
        identity: &IdentityKeyPair,
        id: u32,
        timestamp: u64,
    ) -> Result<GeneratedSignedPreKey>;

    /// Generates `count` pre-keys with consecutive ids starting at `start`.
    fn generate_pre_keys(&self, start: u32, count: u32) -> Result<Vec<GeneratedPreKey>>;

    fn build_session(
        &self,
        stores: &mut dyn RatchetStores,
        address: &ProtocolAddress,
        bundle: &SessionBundle,
    ) -> Result<()>;

    fn encrypt_for(
        &self,
        stores: &mut dyn RatchetStores,
        address: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage>;

    /// Decrypts a key-exchange message, building a fresh session as a side
    /// effect and consuming the referenced pre-key.
    fn decrypt_key_exchange(
        &self,
        stores: &mut dyn RatchetStores,
        address: &ProtocolAddress,
        data: &[u8],
    ) -> Result<KeyExchangeDecryption>;

    fn decrypt(
        &self,
        stores: &mut dyn RatchetStores,
        address: &ProtocolAddress,
        data: &[u8],
    ) -> Result<Vec<u8>>;
}
