use crate::{OwnDevice, PreKeyPair, RemoteDevice, Result, SignedPreKeyPair, StorageAdapter};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Everything a device needs to resume OMEMO after a restart.
#[derive(Debug, Clone, Default)]
pub struct OmemoData {
    pub own_device: Option<OwnDevice>,
    pub signed_pre_key_pairs: BTreeMap<u32, SignedPreKeyPair>,
    pub pre_key_pairs: BTreeMap<u32, PreKeyPair>,
    pub devices: HashMap<String, BTreeMap<u32, RemoteDevice>>,
}

#[derive(Serialize, Deserialize)]
struct StoredDevice {
    jid: String,
    device_id: u32,
    device: RemoteDevice,
}

/// Typed view of the OMEMO records on top of a [`StorageAdapter`].
#[derive(Clone)]
pub struct OmemoStorage {
    storage: Arc<dyn StorageAdapter>,
    storage_version: String,
}

impl OmemoStorage {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            storage_version: "1".to_string(),
        }
    }

    pub fn all_data(&self) -> Result<OmemoData> {
        let own_device = match self.storage.get(&self.own_device_key())? {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };

        let mut signed_pre_key_pairs = BTreeMap::new();
        for key in self.storage.list(&self.signed_pre_key_prefix())? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            let pair: SignedPreKeyPair = serde_json::from_str(&raw)?;
            signed_pre_key_pairs.insert(pair.id, pair);
        }

        let mut pre_key_pairs = BTreeMap::new();
        for key in self.storage.list(&self.pre_key_prefix())? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            let pair: PreKeyPair = serde_json::from_str(&raw)?;
            pre_key_pairs.insert(pair.id, pair);
        }

        let mut devices: HashMap<String, BTreeMap<u32, RemoteDevice>> = HashMap::new();
        for key in self.storage.list(&self.device_prefix())? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            let stored: StoredDevice = serde_json::from_str(&raw)?;
            devices
                .entry(stored.jid)
                .or_default()
                .insert(stored.device_id, stored.device);
        }

        Ok(OmemoData {
            own_device,
            signed_pre_key_pairs,
            pre_key_pairs,
            devices,
        })
    }

    pub fn set_own_device(&self, own_device: &OwnDevice) -> Result<()> {
        self.storage
            .put(&self.own_device_key(), serde_json::to_string(own_device)?)
    }

    pub fn add_signed_pre_key_pair(&self, pair: &SignedPreKeyPair) -> Result<()> {
        self.storage.put(
            &format!("{}{}", self.signed_pre_key_prefix(), pair.id),
            serde_json::to_string(pair)?,
        )
    }

    pub fn remove_signed_pre_key_pair(&self, id: u32) -> Result<()> {
        self.storage
            .del(&format!("{}{}", self.signed_pre_key_prefix(), id))
    }

    pub fn add_pre_key_pairs<'a>(&self, pairs: impl IntoIterator<Item = &'a PreKeyPair>) -> Result<()> {
        for pair in pairs {
            self.storage.put(
                &format!("{}{}", self.pre_key_prefix(), pair.id),
                serde_json::to_string(pair)?,
            )?;
        }
        Ok(())
    }

    pub fn remove_pre_key_pair(&self, id: u32) -> Result<()> {
        self.storage.del(&format!("{}{}", self.pre_key_prefix(), id))
    }

    pub fn add_device(&self, jid: &str, device_id: u32, device: &RemoteDevice) -> Result<()> {
        let stored = StoredDevice {
            jid: jid.to_string(),
            device_id,
            device: device.clone(),
        };
        self.storage
            .put(&self.device_key(jid, device_id), serde_json::to_string(&stored)?)
    }

    pub fn remove_device(&self, jid: &str, device_id: u32) -> Result<()> {
        self.storage.del(&self.device_key(jid, device_id))
    }

    pub fn remove_devices(&self, jid: &str) -> Result<()> {
        self.storage
            .del_prefix(&format!("{}{}/", self.device_prefix(), hex::encode(jid)))
    }

    pub fn reset_all(&self) -> Result<()> {
        self.storage
            .del_prefix(&format!("v{}/omemo/", self.storage_version))
    }

    fn own_device_key(&self) -> String {
        format!("v{}/omemo/own-device", self.storage_version)
    }

    fn signed_pre_key_prefix(&self) -> String {
        format!("v{}/omemo/signed-pre-key/", self.storage_version)
    }

    fn pre_key_prefix(&self) -> String {
        format!("v{}/omemo/pre-key/", self.storage_version)
    }

    fn device_prefix(&self) -> String {
        format!("v{}/omemo/device/", self.storage_version)
    }

    // JIDs are hex encoded so that no JID can be a prefix of another one.
    fn device_key(&self, jid: &str, device_id: u32) -> String {
        format!("{}{}/{}", self.device_prefix(), hex::encode(jid), device_id)
    }
}
