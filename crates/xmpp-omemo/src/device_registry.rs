use crate::types::serde_base64;
use crate::{OmemoStorage, ProtocolAddress, Result, SessionStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDevice {
    #[serde(default)]
    pub label: Option<String>,
    /// Public identity key, empty until first contact.
    #[serde(with = "serde_base64", default)]
    pub key_id: Vec<u8>,
    /// Serialized ratchet session, empty until a session is built.
    #[serde(with = "serde_base64", default)]
    pub session: Vec<u8>,
    #[serde(default)]
    pub unresponded_sent: u32,
    #[serde(default)]
    pub unresponded_received: u32,
    /// When the device disappeared from its owner's device list.
    #[serde(default)]
    pub removal_timestamp: Option<u64>,
}

impl RemoteDevice {
    pub fn has_session(&self) -> bool {
        !self.session.is_empty()
    }
}

/// A device that stayed off its owner's device list for too long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredDevice {
    pub jid: String,
    pub device_id: u32,
    pub key_id: Vec<u8>,
}

/// Records of all known remote devices, own other devices included.
pub struct DeviceRegistry {
    storage: OmemoStorage,
    devices: HashMap<String, BTreeMap<u32, RemoteDevice>>,
    stop_threshold: u32,
    heartbeat_threshold: u32,
}

impl DeviceRegistry {
    pub fn new(storage: OmemoStorage, stop_threshold: u32, heartbeat_threshold: u32) -> Self {
        Self {
            storage,
            devices: HashMap::new(),
            stop_threshold,
            heartbeat_threshold,
        }
    }

    pub fn restore(&mut self, devices: HashMap<String, BTreeMap<u32, RemoteDevice>>) {
        self.devices = devices;
    }

    pub fn get(&self, jid: &str, device_id: u32) -> Option<&RemoteDevice> {
        self.devices.get(jid).and_then(|devices| devices.get(&device_id))
    }

    pub fn contains(&self, jid: &str, device_id: u32) -> bool {
        self.get(jid, device_id).is_some()
    }

    /// Returns the record, creating a zero-valued one on first access.
    pub fn get_or_insert(&mut self, jid: &str, device_id: u32) -> &mut RemoteDevice {
        self.devices
            .entry(jid.to_string())
            .or_default()
            .entry(device_id)
            .or_default()
    }

    /// Applies `update` to an existing record and persists it. Returns
    /// `false` if the device is unknown.
    pub fn update(
        &mut self,
        jid: &str,
        device_id: u32,
        update: impl FnOnce(&mut RemoteDevice),
    ) -> Result<bool> {
        let Some(device) = self
            .devices
            .get_mut(jid)
            .and_then(|devices| devices.get_mut(&device_id))
        else {
            return Ok(false);
        };
        update(device);
        self.storage.add_device(jid, device_id, device)?;
        Ok(true)
    }

    pub fn save(&self, jid: &str, device_id: u32) -> Result<()> {
        match self.get(jid, device_id) {
            Some(device) => self.storage.add_device(jid, device_id, device),
            None => Ok(()),
        }
    }

    pub fn devices_of(&self, jid: &str) -> impl Iterator<Item = (u32, &RemoteDevice)> {
        self.devices
            .get(jid)
            .into_iter()
            .flat_map(|devices| devices.iter().map(|(id, device)| (*id, device)))
    }

    pub fn jids(&self) -> impl Iterator<Item = &String> {
        self.devices.keys()
    }

    pub fn is_excluded(&self, device: &RemoteDevice) -> bool {
        device.unresponded_sent >= self.stop_threshold
    }

    /// Records a stanza encrypted for the device.
    pub fn mark_sent(&mut self, jid: &str, device_id: u32) -> Result<()> {
        let stop_threshold = self.stop_threshold;
        self.update(jid, device_id, |device| {
            device.unresponded_received = 0;
            if device.unresponded_sent < stop_threshold {
                device.unresponded_sent += 1;
            }
        })?;
        Ok(())
    }

    /// Records a stanza decrypted from the device. Returns whether a
    /// heartbeat message is due.
    pub fn mark_responded(&mut self, jid: &str, device_id: u32) -> Result<bool> {
        let heartbeat_threshold = self.heartbeat_threshold;
        let device = self.get_or_insert(jid, device_id);
        device.unresponded_sent = 0;
        let heartbeat_due = device.unresponded_received >= heartbeat_threshold;
        if heartbeat_due {
            device.unresponded_received = 0;
        } else {
            device.unresponded_received += 1;
        }
        self.save(jid, device_id)?;
        Ok(heartbeat_due)
    }

    /// Records an empty message from the device. It proves the device is
    /// alive without counting toward the heartbeat.
    pub fn mark_probe_received(&mut self, jid: &str, device_id: u32) -> Result<()> {
        self.get_or_insert(jid, device_id).unresponded_sent = 0;
        self.save(jid, device_id)
    }

    /// Devices whose removal timestamp is at least `interval` seconds old.
    pub fn expired_devices(&self, now: u64, interval: u64) -> Vec<ExpiredDevice> {
        let mut expired = Vec::new();
        for (jid, devices) in &self.devices {
            for (id, device) in devices {
                if device
                    .removal_timestamp
                    .is_some_and(|removed_at| removed_at.saturating_add(interval) <= now)
                {
                    expired.push(ExpiredDevice {
                        jid: jid.clone(),
                        device_id: *id,
                        key_id: device.key_id.clone(),
                    });
                }
            }
        }
        expired
    }

    pub fn remove(&mut self, jid: &str, device_id: u32) -> Result<Option<RemoteDevice>> {
        let removed = match self.devices.get_mut(jid) {
            Some(devices) => {
                let removed = devices.remove(&device_id);
                if devices.is_empty() {
                    self.devices.remove(jid);
                }
                removed
            }
            None => None,
        };
        self.storage.remove_device(jid, device_id)?;
        Ok(removed)
    }

    pub fn remove_owner(&mut self, jid: &str) -> Result<BTreeMap<u32, RemoteDevice>> {
        let removed = self.devices.remove(jid).unwrap_or_default();
        self.storage.remove_devices(jid)?;
        Ok(removed)
    }

    pub fn reset(&mut self) {
        self.devices.clear();
    }
}

impl SessionStore for DeviceRegistry {
    fn load_session(&self, address: &ProtocolAddress) -> Option<Vec<u8>> {
        self.get(&address.jid, address.device_id)
            .filter(|device| device.has_session())
            .map(|device| device.session.clone())
    }

    fn store_session(&mut self, address: &ProtocolAddress, record: Vec<u8>) -> Result<()> {
        self.get_or_insert(&address.jid, address.device_id).session = record;
        self.save(&address.jid, address.device_id)
    }

    fn contains_session(&self, address: &ProtocolAddress) -> bool {
        self.get(&address.jid, address.device_id)
            .is_some_and(RemoteDevice::has_session)
    }

    fn delete_session(&mut self, address: &ProtocolAddress) -> Result<()> {
        self.update(&address.jid, address.device_id, |device| device.session.clear())?;
        Ok(())
    }

    fn sub_device_sessions(&self, jid: &str) -> Vec<u32> {
        self.devices_of(jid)
            .filter(|(_, device)| device.has_session() && !self.is_excluded(device))
            .map(|(id, _)| id)
            .collect()
    }
}
