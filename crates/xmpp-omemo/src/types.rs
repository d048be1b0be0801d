use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::TrustLevel;

pub const DEVICE_ID_MIN: u32 = 1;
pub const DEVICE_ID_MAX: u32 = i32::MAX as u32;
pub const PRE_KEY_ID_MIN: u32 = 1;
pub const PRE_KEY_ID_MAX: u32 = i32::MAX as u32;
pub const SIGNED_PRE_KEY_ID_MIN: u32 = 1;
pub const SIGNED_PRE_KEY_ID_MAX: u32 = i32::MAX as u32;

/// PEP node holding the device list of an account.
pub const DEVICES_NODE: &str = "urn:xmpp:omemo:2:devices";
/// PEP node holding one bundle item per device.
pub const BUNDLES_NODE: &str = "urn:xmpp:omemo:2:bundles";
/// Item id of the singleton device list item.
pub const DEVICE_LIST_ITEM_ID: &str = "current";

/// Size of the all-zero secret wrapped by empty (probe) messages.
pub const PROBE_SECRET_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListEntry {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl DeviceListEntry {
    pub fn new(id: u32, label: Option<String>) -> Self {
        Self { id, label }
    }
}

/// One item of a device list node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListItem {
    pub id: String,
    pub devices: Vec<DeviceListEntry>,
}

impl DeviceListItem {
    pub fn current(devices: Vec<DeviceListEntry>) -> Self {
        Self {
            id: DEVICE_LIST_ITEM_ID.to_string(),
            devices,
        }
    }

    pub fn is_current(&self) -> bool {
        self.id == DEVICE_LIST_ITEM_ID
    }
}

/// Public key material a device publishes so that others can build sessions
/// with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBundle {
    #[serde(with = "serde_base64")]
    pub identity_key: Vec<u8>,
    pub signed_pre_key_id: u32,
    #[serde(with = "serde_base64")]
    pub signed_pre_key: Vec<u8>,
    #[serde(with = "serde_base64")]
    pub signed_pre_key_signature: Vec<u8>,
    #[serde(with = "serde_base64_map")]
    pub pre_keys: BTreeMap<u32, Vec<u8>>,
}

impl DeviceBundle {
    pub fn is_usable(&self) -> bool {
        !self.identity_key.is_empty() && !self.signed_pre_key.is_empty() && !self.pre_keys.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OmemoEnvelope {
    pub recipient_device_id: u32,
    pub is_key_exchange: bool,
    #[serde(with = "serde_base64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressedEnvelope {
    pub recipient_jid: String,
    #[serde(flatten)]
    pub envelope: OmemoEnvelope,
}

/// Encrypted stanza content: one shared payload plus one envelope per
/// recipient device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OmemoElement {
    pub sender_device_id: u32,
    #[serde(with = "serde_base64", default)]
    pub payload: Vec<u8>,
    pub envelopes: Vec<AddressedEnvelope>,
}

impl OmemoElement {
    pub fn new(sender_device_id: u32) -> Self {
        Self {
            sender_device_id,
            payload: Vec::new(),
            envelopes: Vec::new(),
        }
    }

    pub fn add_envelope(&mut self, recipient_jid: impl Into<String>, envelope: OmemoEnvelope) {
        self.envelopes.push(AddressedEnvelope {
            recipient_jid: recipient_jid.into(),
            envelope,
        });
    }

    pub fn search_envelope(&self, recipient_jid: &str, device_id: u32) -> Option<&OmemoEnvelope> {
        self.envelopes
            .iter()
            .find(|e| e.recipient_jid == recipient_jid && e.envelope.recipient_device_id == device_id)
            .map(|e| &e.envelope)
    }

    /// An element without payload only establishes or refreshes a session.
    pub fn is_empty_message(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Iq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedContent {
    pub sender_jid: String,
    pub sender_device_id: u32,
    pub sender_key_id: Vec<u8>,
    /// Timestamp declared by the sender inside the content envelope.
    pub timestamp: u64,
    pub to: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    Decrypted(DecryptedContent),
    /// An empty message refreshed or confirmed the session.
    SessionConfirmed,
    /// The element carries no envelope for this device.
    NotForThisDevice,
    /// No session existed; one is being built for future stanzas.
    NoSessionYet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub jid: String,
    pub device_id: u32,
    pub label: Option<String>,
    pub key_id: Vec<u8>,
    pub trust_level: TrustLevel,
    pub has_session: bool,
    pub removal_timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OmemoEvent {
    DeviceAdded { jid: String, device_id: u32 },
    DeviceChanged { jid: String, device_id: u32 },
    DeviceRemoved { jid: String, device_id: u32 },
    DevicesRemoved { jid: String },
    AllDevicesRemoved,
}

pub(crate) mod serde_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod serde_base64_map {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<u32, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map_serializer = serializer.serialize_map(Some(map.len()))?;
        for (k, v) in map {
            map_serializer.serialize_entry(k, &STANDARD.encode(v))?;
        }
        map_serializer.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<u32, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map: BTreeMap<u32, String> = BTreeMap::deserialize(deserializer)?;
        map.into_iter()
            .map(|(k, v)| {
                let bytes = STANDARD.decode(v).map_err(serde::de::Error::custom)?;
                Ok((k, bytes))
            })
            .collect()
    }
}
