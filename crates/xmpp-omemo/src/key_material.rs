use crate::types::serde_base64;
use crate::utils::next_id_block;
use crate::{
    DeviceBundle, Error, IdentityKeyPair, IdentityKeyStore, OmemoStorage, PreKeyStore,
    RatchetEngine, Result, SignedPreKeyStore, PRE_KEY_ID_MAX, PRE_KEY_ID_MIN,
    SIGNED_PRE_KEY_ID_MAX, SIGNED_PRE_KEY_ID_MIN,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnDevice {
    pub id: u32,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(with = "serde_base64")]
    pub private_identity_key: Vec<u8>,
    #[serde(with = "serde_base64")]
    pub public_identity_key: Vec<u8>,
    /// Zero until the first signed pre-key exists.
    pub latest_signed_pre_key_id: u32,
    /// Zero until the first pre-keys exist.
    pub latest_pre_key_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyPair {
    pub id: u32,
    pub created_at: u64,
    #[serde(with = "serde_base64")]
    pub record: Vec<u8>,
    #[serde(with = "serde_base64")]
    pub public_key: Vec<u8>,
    #[serde(with = "serde_base64")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyPair {
    pub id: u32,
    #[serde(with = "serde_base64")]
    pub record: Vec<u8>,
    #[serde(with = "serde_base64")]
    pub public_key: Vec<u8>,
}

/// This device's identity, signed pre-keys and one-time pre-keys, together
/// with the public bundle derived from them.
///
/// Every mutation is written through to storage right away.
pub struct KeyMaterialStore {
    engine: Arc<dyn RatchetEngine>,
    storage: OmemoStorage,
    own_device: OwnDevice,
    signed_pre_key_pairs: BTreeMap<u32, SignedPreKeyPair>,
    pre_key_pairs: BTreeMap<u32, PreKeyPair>,
    bundle: DeviceBundle,
    bundle_changed: bool,
}

impl KeyMaterialStore {
    pub fn new(engine: Arc<dyn RatchetEngine>, storage: OmemoStorage) -> Self {
        Self {
            engine,
            storage,
            own_device: OwnDevice::default(),
            signed_pre_key_pairs: BTreeMap::new(),
            pre_key_pairs: BTreeMap::new(),
            bundle: DeviceBundle::default(),
            bundle_changed: false,
        }
    }

    /// Restores previously stored key material. Returns `None` if the own
    /// device or any kind of key is missing.
    pub fn restore(
        engine: Arc<dyn RatchetEngine>,
        storage: OmemoStorage,
        own_device: Option<OwnDevice>,
        signed_pre_key_pairs: BTreeMap<u32, SignedPreKeyPair>,
        pre_key_pairs: BTreeMap<u32, PreKeyPair>,
    ) -> Option<Self> {
        let own_device = own_device?;
        if signed_pre_key_pairs.is_empty() || pre_key_pairs.is_empty() {
            return None;
        }

        let mut store = Self {
            engine,
            storage,
            own_device,
            signed_pre_key_pairs,
            pre_key_pairs,
            bundle: DeviceBundle::default(),
            bundle_changed: false,
        };
        store.rebuild_bundle();
        Some(store)
    }

    pub fn own_device(&self) -> &OwnDevice {
        &self.own_device
    }

    pub fn set_device_id(&mut self, id: u32) {
        self.own_device.id = id;
    }

    pub fn set_label(&mut self, label: Option<String>) {
        self.own_device.label = label;
    }

    pub fn save_own_device(&self) -> Result<()> {
        self.storage.set_own_device(&self.own_device)
    }

    pub fn bundle(&self) -> &DeviceBundle {
        &self.bundle
    }

    /// Whether the bundle changed since the last call, e.g. because a peer
    /// consumed a pre-key.
    pub fn take_bundle_changed(&mut self) -> bool {
        std::mem::take(&mut self.bundle_changed)
    }

    pub fn pre_key_count(&self) -> usize {
        self.pre_key_pairs.len()
    }

    pub fn signed_pre_key_pairs(&self) -> impl Iterator<Item = &SignedPreKeyPair> {
        self.signed_pre_key_pairs.values()
    }

    pub fn generate_identity(&mut self) -> Result<()> {
        let identity = self
            .engine
            .generate_identity_key_pair()
            .map_err(|e| Error::Setup(format!("identity key pair could not be generated: {e}")))?;
        self.bundle.identity_key = identity.public_key.clone();
        self.own_device.public_identity_key = identity.public_key;
        self.own_device.private_identity_key = identity.private_key;
        Ok(())
    }

    /// Generates the next signed pre-key and makes it the one offered in the
    /// bundle. Earlier signed pre-keys stay until they expire.
    pub fn rotate_signed_pre_key(&mut self, now: u64) -> Result<u32> {
        let id = next_id_block(
            self.own_device.latest_signed_pre_key_id,
            1,
            SIGNED_PRE_KEY_ID_MIN,
            SIGNED_PRE_KEY_ID_MAX,
        );
        let generated = self
            .engine
            .generate_signed_pre_key(&self.identity_key_pair(), id, now)?;

        let pair = SignedPreKeyPair {
            id,
            created_at: now,
            record: generated.record,
            public_key: generated.public_key,
            signature: generated.signature,
        };
        self.storage.add_signed_pre_key_pair(&pair)?;

        self.bundle.signed_pre_key_id = id;
        self.bundle.signed_pre_key = pair.public_key.clone();
        self.bundle.signed_pre_key_signature = pair.signature.clone();
        self.signed_pre_key_pairs.insert(id, pair);
        self.own_device.latest_signed_pre_key_id = id;
        self.bundle_changed = true;
        Ok(id)
    }

    /// Generates `count` pre-keys with ids following the latest one.
    pub fn replenish_pre_keys(&mut self, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let start = next_id_block(
            self.own_device.latest_pre_key_id,
            count,
            PRE_KEY_ID_MIN,
            PRE_KEY_ID_MAX,
        );
        let generated = self.engine.generate_pre_keys(start, count)?;

        let pairs: Vec<PreKeyPair> = generated
            .into_iter()
            .map(|key| PreKeyPair {
                id: key.id,
                record: key.record,
                public_key: key.public_key,
            })
            .collect();
        self.storage.add_pre_key_pairs(&pairs)?;

        for pair in pairs {
            self.bundle.pre_keys.insert(pair.id, pair.public_key.clone());
            self.pre_key_pairs.insert(pair.id, pair);
        }
        self.own_device.latest_pre_key_id = start - 1 + count;
        self.bundle_changed = true;
        Ok(())
    }

    /// Removes a pre-key a peer used and generates exactly one replacement.
    pub fn consume_pre_key(&mut self, id: u32) -> Result<()> {
        if self.pre_key_pairs.remove(&id).is_none() {
            return Ok(());
        }
        self.storage.remove_pre_key_pair(id)?;
        self.bundle.pre_keys.remove(&id);
        debug!(pre_key_id = id, "pre key consumed");

        self.replenish_pre_keys(1)?;
        self.save_own_device()
    }

    /// Deletes signed pre-keys created at least `interval` seconds before
    /// `now` and, if any was deleted, generates one replacement.
    ///
    /// Returns whether the bundle changed.
    pub fn renew_signed_pre_keys(&mut self, now: u64, interval: u64) -> Result<bool> {
        let expired: Vec<u32> = self
            .signed_pre_key_pairs
            .values()
            .filter(|pair| pair.created_at.saturating_add(interval) <= now)
            .map(|pair| pair.id)
            .collect();
        if expired.is_empty() {
            return Ok(false);
        }

        for id in &expired {
            self.signed_pre_key_pairs.remove(id);
            self.storage.remove_signed_pre_key_pair(*id)?;
        }
        debug!(count = expired.len(), "expired signed pre keys removed");

        self.rotate_signed_pre_key(now)?;
        self.save_own_device()?;
        Ok(true)
    }

    pub fn reset(&mut self) {
        self.own_device = OwnDevice::default();
        self.signed_pre_key_pairs.clear();
        self.pre_key_pairs.clear();
        self.bundle = DeviceBundle::default();
        self.bundle_changed = false;
    }

    fn rebuild_bundle(&mut self) {
        let mut bundle = DeviceBundle {
            identity_key: self.own_device.public_identity_key.clone(),
            ..Default::default()
        };
        let current = self
            .signed_pre_key_pairs
            .get(&self.own_device.latest_signed_pre_key_id)
            .or_else(|| self.signed_pre_key_pairs.values().max_by_key(|p| p.created_at));
        if let Some(pair) = current {
            bundle.signed_pre_key_id = pair.id;
            bundle.signed_pre_key = pair.public_key.clone();
            bundle.signed_pre_key_signature = pair.signature.clone();
        }
        bundle.pre_keys = self
            .pre_key_pairs
            .values()
            .map(|pair| (pair.id, pair.public_key.clone()))
            .collect();
        self.bundle = bundle;
    }
}

impl IdentityKeyStore for KeyMaterialStore {
    fn identity_key_pair(&self) -> IdentityKeyPair {
        IdentityKeyPair {
            public_key: self.own_device.public_identity_key.clone(),
            private_key: self.own_device.private_identity_key.clone(),
        }
    }

    fn local_registration_id(&self) -> u32 {
        self.own_device.id
    }
}

impl PreKeyStore for KeyMaterialStore {
    fn load_pre_key(&self, id: u32) -> Option<Vec<u8>> {
        self.pre_key_pairs.get(&id).map(|pair| pair.record.clone())
    }

    fn store_pre_key(&mut self, id: u32, record: Vec<u8>) -> Result<()> {
        let public_key = self
            .pre_key_pairs
            .get(&id)
            .map(|pair| pair.public_key.clone())
            .unwrap_or_default();
        let pair = PreKeyPair {
            id,
            record,
            public_key,
        };
        self.storage.add_pre_key_pairs([&pair])?;
        self.pre_key_pairs.insert(id, pair);
        Ok(())
    }

    fn contains_pre_key(&self, id: u32) -> bool {
        self.pre_key_pairs.contains_key(&id)
    }

    fn remove_pre_key(&mut self, id: u32) -> Result<()> {
        self.consume_pre_key(id)
    }
}

impl SignedPreKeyStore for KeyMaterialStore {
    fn load_signed_pre_key(&self, id: u32) -> Option<Vec<u8>> {
        self.signed_pre_key_pairs.get(&id).map(|pair| pair.record.clone())
    }

    fn store_signed_pre_key(&mut self, id: u32, record: Vec<u8>) -> Result<()> {
        let pair = match self.signed_pre_key_pairs.get(&id) {
            Some(existing) => SignedPreKeyPair {
                record,
                ..existing.clone()
            },
            None => SignedPreKeyPair {
                id,
                created_at: crate::utils::now_secs(),
                record,
                public_key: Vec::new(),
                signature: Vec::new(),
            },
        };
        self.storage.add_signed_pre_key_pair(&pair)?;
        self.signed_pre_key_pairs.insert(id, pair);
        Ok(())
    }

    fn contains_signed_pre_key(&self, id: u32) -> bool {
        self.signed_pre_key_pairs.contains_key(&id)
    }

    fn remove_signed_pre_key(&mut self, id: u32) -> Result<()> {
        self.signed_pre_key_pairs.remove(&id);
        self.storage.remove_signed_pre_key_pair(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        EncryptedMessage, GeneratedPreKey, GeneratedSignedPreKey, InMemoryStorage, KeyExchangeDecryption,
        ProtocolAddress, RatchetStores, SessionBundle,
    };

    struct KeyOnlyEngine;

    impl RatchetEngine for KeyOnlyEngine {
        fn generate_identity_key_pair(&self) -> Result<IdentityKeyPair> {
            Ok(IdentityKeyPair {
                public_key: vec![1; 32],
                private_key: vec![2; 32],
            })
        }

        fn generate_signed_pre_key(
            &self,
            _identity: &IdentityKeyPair,
            id: u32,
            _timestamp: u64,
        ) -> Result<GeneratedSignedPreKey> {
            Ok(GeneratedSignedPreKey {
                id,
                record: id.to_be_bytes().to_vec(),
                public_key: vec![id as u8; 32],
                signature: vec![0; 64],
            })
        }

        fn generate_pre_keys(&self, start: u32, count: u32) -> Result<Vec<GeneratedPreKey>> {
            Ok((start..start + count)
                .map(|id| GeneratedPreKey {
                    id,
                    record: id.to_be_bytes().to_vec(),
                    public_key: id.to_le_bytes().to_vec(),
                })
                .collect())
        }

        fn build_session(
            &self,
            _stores: &mut dyn RatchetStores,
            _address: &ProtocolAddress,
            _bundle: &SessionBundle,
        ) -> Result<()> {
            Err(Error::Ratchet("unsupported".to_string()))
        }

        fn encrypt_for(
            &self,
            _stores: &mut dyn RatchetStores,
            _address: &ProtocolAddress,
            _plaintext: &[u8],
        ) -> Result<EncryptedMessage> {
            Err(Error::Ratchet("unsupported".to_string()))
        }

        fn decrypt_key_exchange(
            &self,
            _stores: &mut dyn RatchetStores,
            _address: &ProtocolAddress,
            _data: &[u8],
        ) -> Result<KeyExchangeDecryption> {
            Err(Error::Ratchet("unsupported".to_string()))
        }

        fn decrypt(
            &self,
            _stores: &mut dyn RatchetStores,
            _address: &ProtocolAddress,
            _data: &[u8],
        ) -> Result<Vec<u8>> {
            Err(Error::Ratchet("unsupported".to_string()))
        }
    }

    fn set_up_store() -> (KeyMaterialStore, OmemoStorage) {
        let storage = OmemoStorage::new(Arc::new(InMemoryStorage::new()));
        let mut store = KeyMaterialStore::new(Arc::new(KeyOnlyEngine), storage.clone());
        store.set_device_id(42);
        store.generate_identity().unwrap();
        store.rotate_signed_pre_key(1_000).unwrap();
        store.replenish_pre_keys(100).unwrap();
        store.save_own_device().unwrap();
        (store, storage)
    }

    #[test]
    fn set_up_fills_bundle() {
        let (store, _) = set_up_store();
        let bundle = store.bundle();
        assert_eq!(bundle.identity_key, vec![1; 32]);
        assert_eq!(bundle.signed_pre_key_id, 1);
        assert_eq!(bundle.pre_keys.len(), 100);
        assert_eq!(bundle.pre_keys.keys().next(), Some(&1));
        assert_eq!(store.own_device().latest_pre_key_id, 100);
    }

    #[test]
    fn consuming_pre_key_replenishes_exactly_one() {
        let (mut store, storage) = set_up_store();
        store.take_bundle_changed();

        store.remove_pre_key(17).unwrap();

        assert_eq!(store.pre_key_count(), 100);
        assert!(!store.contains_pre_key(17));
        assert!(store.contains_pre_key(101));
        assert!(store.take_bundle_changed());
        assert!(!store.bundle().pre_keys.contains_key(&17));

        let data = storage.all_data().unwrap();
        assert!(!data.pre_key_pairs.contains_key(&17));
        assert_eq!(data.own_device.unwrap().latest_pre_key_id, 101);
    }

    #[test]
    fn consuming_unknown_pre_key_is_a_no_op() {
        let (mut store, _) = set_up_store();
        store.take_bundle_changed();
        store.consume_pre_key(5_000).unwrap();
        assert_eq!(store.pre_key_count(), 100);
        assert!(!store.take_bundle_changed());
    }

    #[test]
    fn pre_key_ids_wrap_near_maximum() {
        let (mut store, _) = set_up_store();
        store.own_device.latest_pre_key_id = PRE_KEY_ID_MAX - 1;
        store.replenish_pre_keys(5).unwrap();
        assert_eq!(store.own_device().latest_pre_key_id, 5);
    }

    #[test]
    fn signed_pre_key_ids_wrap_to_minimum() {
        let (mut store, _) = set_up_store();
        store.own_device.latest_signed_pre_key_id = SIGNED_PRE_KEY_ID_MAX;
        assert_eq!(store.rotate_signed_pre_key(2_000).unwrap(), SIGNED_PRE_KEY_ID_MIN);
    }

    #[test]
    fn renewal_replaces_only_expired_signed_pre_keys() {
        let (mut store, storage) = set_up_store();
        let interval = 100;

        assert!(!store.renew_signed_pre_keys(1_050, interval).unwrap());
        assert!(store.renew_signed_pre_keys(1_100, interval).unwrap());

        let ids: Vec<u32> = store.signed_pre_key_pairs().map(|p| p.id).collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(store.bundle().signed_pre_key_id, 2);
        assert_eq!(storage.all_data().unwrap().signed_pre_key_pairs.len(), 1);
    }

    #[test]
    fn restore_requires_all_key_kinds() {
        let (_, storage) = set_up_store();
        let data = storage.all_data().unwrap();

        let restored = KeyMaterialStore::restore(
            Arc::new(KeyOnlyEngine),
            storage.clone(),
            data.own_device.clone(),
            data.signed_pre_key_pairs.clone(),
            data.pre_key_pairs.clone(),
        )
        .expect("complete data restores");
        assert_eq!(restored.bundle().pre_keys.len(), 100);
        assert_eq!(restored.bundle().signed_pre_key_id, 1);

        assert!(KeyMaterialStore::restore(
            Arc::new(KeyOnlyEngine),
            storage,
            data.own_device,
            data.signed_pre_key_pairs,
            BTreeMap::new(),
        )
        .is_none());
    }
}
