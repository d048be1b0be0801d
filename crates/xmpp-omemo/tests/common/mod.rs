#![allow(dead_code)]

use async_trait::async_trait;
use crossbeam_channel::Receiver;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use xmpp_omemo::pubsub::{ItemLimit, NodeConfig, PepFeatures, PubSubItem, PubSubService};
use xmpp_omemo::{
    DecryptError, DecryptOutcome, DeviceBundle, DeviceDirectory, DeviceListEntry, DeviceListItem,
    EncryptedMessage, Error, GeneratedPreKey,
    GeneratedSignedPreKey, IdentityKeyPair, InMemoryStorage, KeyExchangeDecryption,
    MemoryTrustStore, OmemoConfig, OmemoEvent, OmemoManager, OmemoServices, OutgoingMessage,
    PepDirectory, ProtocolAddress, RatchetEngine, RatchetStores, Result, SecurityPolicy,
    SessionBundle, StanzaSender, StorageAdapter, BUNDLES_NODE, DEVICES_NODE,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sha256(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

fn random_bytes() -> Vec<u8> {
    let mut bytes = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[derive(Serialize, Deserialize)]
struct SimulatedSession {
    root: Vec<u8>,
    /// Set until the peer answers. Messages keep carrying the key exchange
    /// meanwhile.
    pending: Option<(u32, u32)>,
}

#[derive(Serialize, Deserialize)]
struct SimulatedMessage {
    sender_identity: Vec<u8>,
    pre_key_id: Option<u32>,
    signed_pre_key_id: Option<u32>,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
}

/// Stand-in for the double ratchet. Public keys are hashes of private keys
/// and a session is a shared root both sides derive from the same public
/// material, which is enough to exercise every store interaction.
#[derive(Default)]
pub struct SimulatedRatchet;

impl SimulatedRatchet {
    fn keystream_xor(root: &[u8], nonce: &[u8], data: &[u8]) -> Vec<u8> {
        data.chunks(32)
            .enumerate()
            .flat_map(|(block, chunk)| {
                let key = sha256(&[root, nonce, &(block as u32).to_be_bytes()]);
                chunk
                    .iter()
                    .zip(key)
                    .map(|(byte, key)| byte ^ key)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn seal(root: &[u8], sender_identity: Vec<u8>, pending: Option<(u32, u32)>, plaintext: &[u8]) -> Vec<u8> {
        let nonce = random_bytes();
        let ciphertext = Self::keystream_xor(root, &nonce, plaintext);
        let tag = sha256(&[root, &nonce, &ciphertext]);
        let message = SimulatedMessage {
            sender_identity,
            pre_key_id: pending.map(|(pre_key_id, _)| pre_key_id),
            signed_pre_key_id: pending.map(|(_, signed_pre_key_id)| signed_pre_key_id),
            nonce,
            ciphertext,
            tag,
        };
        serde_json::to_vec(&message).unwrap_or_default()
    }

    fn open(root: &[u8], message: &SimulatedMessage) -> Option<Vec<u8>> {
        if sha256(&[root, &message.nonce, &message.ciphertext]) != message.tag {
            return None;
        }
        Some(Self::keystream_xor(root, &message.nonce, &message.ciphertext))
    }

    fn parse(data: &[u8]) -> Result<SimulatedMessage> {
        serde_json::from_slice(data).map_err(|e| DecryptError::InvalidMessage(e.to_string()).into())
    }

    fn load_session(stores: &mut dyn RatchetStores, address: &ProtocolAddress) -> Option<SimulatedSession> {
        let record = stores.sessions().load_session(address)?;
        serde_json::from_slice(&record).ok()
    }

    fn store_session(stores: &mut dyn RatchetStores, address: &ProtocolAddress, session: &SimulatedSession) -> Result<()> {
        stores.sessions().store_session(address, serde_json::to_vec(session)?)
    }
}

impl RatchetEngine for SimulatedRatchet {
    fn generate_identity_key_pair(&self) -> Result<IdentityKeyPair> {
        let private_key = random_bytes();
        Ok(IdentityKeyPair {
            public_key: sha256(&[&private_key]),
            private_key,
        })
    }

    fn generate_signed_pre_key(&self, identity: &IdentityKeyPair, id: u32, _timestamp: u64) -> Result<GeneratedSignedPreKey> {
        let record = random_bytes();
        let public_key = sha256(&[&record]);
        Ok(GeneratedSignedPreKey {
            id,
            signature: sha256(&[&identity.private_key, &public_key]),
            record,
            public_key,
        })
    }

    fn generate_pre_keys(&self, start: u32, count: u32) -> Result<Vec<GeneratedPreKey>> {
        Ok((start..start + count)
            .map(|id| {
                let record = random_bytes();
                GeneratedPreKey {
                    id,
                    public_key: sha256(&[&record]),
                    record,
                }
            })
            .collect())
    }

    fn build_session(&self, stores: &mut dyn RatchetStores, address: &ProtocolAddress, bundle: &SessionBundle) -> Result<()> {
        let own_identity = stores.identity().identity_key_pair().public_key;
        let root = sha256(&[
            &own_identity,
            &bundle.identity_key,
            &bundle.pre_key,
            &bundle.signed_pre_key,
        ]);
        let session = SimulatedSession {
            root,
            pending: Some((bundle.pre_key_id, bundle.signed_pre_key_id)),
        };
        Self::store_session(stores, address, &session)
    }

    fn encrypt_for(&self, stores: &mut dyn RatchetStores, address: &ProtocolAddress, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let session = Self::load_session(stores, address).ok_or(DecryptError::NoSession)?;
        let own_identity = stores.identity().identity_key_pair().public_key;
        Ok(EncryptedMessage {
            data: Self::seal(&session.root, own_identity, session.pending, plaintext),
            is_key_exchange: session.pending.is_some(),
        })
    }

    fn decrypt_key_exchange(&self, stores: &mut dyn RatchetStores, address: &ProtocolAddress, data: &[u8]) -> Result<KeyExchangeDecryption> {
        let message = Self::parse(data)?;
        let (Some(pre_key_id), Some(signed_pre_key_id)) = (message.pre_key_id, message.signed_pre_key_id) else {
            return Err(DecryptError::InvalidMessage("no key exchange".to_string()).into());
        };

        let Some(pre_key) = stores.pre_keys().load_pre_key(pre_key_id) else {
            // A repeated key exchange for a session that already exists.
            let existing = Self::load_session(stores, address)
                .and_then(|session| Self::open(&session.root, &message));
            return match existing {
                Some(plaintext) => Ok(KeyExchangeDecryption {
                    plaintext,
                    identity_key: message.sender_identity,
                }),
                None => Err(DecryptError::UnknownPreKey(pre_key_id).into()),
            };
        };
        let signed_pre_key = stores
            .signed_pre_keys()
            .load_signed_pre_key(signed_pre_key_id)
            .ok_or_else(|| DecryptError::InvalidMessage("unknown signed pre key".to_string()))?;

        let own_identity = stores.identity().identity_key_pair().public_key;
        let root = sha256(&[
            &message.sender_identity,
            &own_identity,
            &sha256(&[&pre_key]),
            &sha256(&[&signed_pre_key]),
        ]);
        let plaintext = Self::open(&root, &message).ok_or(DecryptError::InvalidMac)?;

        Self::store_session(stores, address, &SimulatedSession { root, pending: None })?;
        stores.pre_keys().remove_pre_key(pre_key_id)?;
        Ok(KeyExchangeDecryption {
            plaintext,
            identity_key: message.sender_identity,
        })
    }

    fn decrypt(&self, stores: &mut dyn RatchetStores, address: &ProtocolAddress, data: &[u8]) -> Result<Vec<u8>> {
        let message = Self::parse(data)?;
        let mut session = Self::load_session(stores, address).ok_or(DecryptError::NoSession)?;
        let plaintext = Self::open(&session.root, &message).ok_or(DecryptError::InvalidMac)?;
        if session.pending.take().is_some() {
            Self::store_session(stores, address, &session)?;
        }
        Ok(plaintext)
    }
}

#[derive(Default)]
struct Node {
    config: Option<NodeConfig>,
    items: Vec<PubSubItem>,
}

/// In-memory PEP service shared by all test clients.
#[derive(Default)]
pub struct PepServer {
    nodes: Mutex<HashMap<(String, String), Node>>,
    subscriptions: Mutex<HashMap<String, HashSet<String>>>,
}

impl PepServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn items(&self, jid: &str, node: &str) -> Vec<PubSubItem> {
        self.nodes
            .lock()
            .unwrap()
            .get(&(jid.to_string(), node.to_string()))
            .map(|node| node.items.clone())
            .unwrap_or_default()
    }

    pub fn node_exists(&self, jid: &str, node: &str) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .contains_key(&(jid.to_string(), node.to_string()))
    }

    pub fn device_list(&self, jid: &str) -> Vec<xmpp_omemo::DeviceListEntry> {
        self.items(jid, DEVICES_NODE)
            .into_iter()
            .find(|item| item.id == "current")
            .map(|item| serde_json::from_str(&item.payload).unwrap())
            .unwrap_or_default()
    }

    pub fn bundle(&self, jid: &str, device_id: u32) -> Option<DeviceBundle> {
        self.items(jid, BUNDLES_NODE)
            .into_iter()
            .find(|item| item.id == device_id.to_string())
            .map(|item| serde_json::from_str(&item.payload).unwrap())
    }

    pub fn publish_raw(&self, jid: &str, node: &str, item: PubSubItem) {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.entry((jid.to_string(), node.to_string())).or_default();
        node.items.retain(|existing| existing.id != item.id);
        node.items.push(item);
    }

    pub fn is_subscribed(&self, subscriber: &str, jid: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscriber)
            .is_some_and(|jids| jids.contains(jid))
    }
}

/// One account's connection to the `PepServer`.
pub struct PepClient {
    server: Arc<PepServer>,
    jid: String,
    features: PepFeatures,
}

impl PepClient {
    pub fn new(server: Arc<PepServer>, jid: &str, features: PepFeatures) -> Self {
        Self {
            server,
            jid: jid.to_string(),
            features,
        }
    }

    fn key(&self, node: &str) -> (String, String) {
        (self.jid.clone(), node.to_string())
    }
}

pub fn full_features() -> PepFeatures {
    PepFeatures {
        publish_options: true,
        auto_create: true,
        create_nodes: true,
        create_and_configure: true,
        config_node: true,
        config_node_max: true,
    }
}

#[async_trait]
impl PubSubService for PepClient {
    async fn own_features(&self) -> Result<PepFeatures> {
        Ok(self.features)
    }

    async fn own_node_exists(&self, node: &str) -> Result<bool> {
        Ok(self.server.node_exists(&self.jid, node))
    }

    async fn create_own_node(&self, node: &str, config: Option<&NodeConfig>) -> Result<()> {
        let mut nodes = self.server.nodes.lock().unwrap();
        if nodes.contains_key(&self.key(node)) {
            return Err(Error::Directory("conflict".to_string()));
        }
        nodes.insert(
            self.key(node),
            Node {
                config: config.cloned(),
                items: Vec::new(),
            },
        );
        Ok(())
    }

    async fn configure_own_node(&self, node: &str, config: &NodeConfig) -> Result<()> {
        let mut nodes = self.server.nodes.lock().unwrap();
        let node = nodes
            .get_mut(&self.key(node))
            .ok_or_else(|| Error::Directory("item-not-found".to_string()))?;
        node.config = Some(config.clone());
        Ok(())
    }

    async fn publish_own_item(&self, node: &str, item: PubSubItem, options: Option<&NodeConfig>) -> Result<()> {
        let mut nodes = self.server.nodes.lock().unwrap();
        if !nodes.contains_key(&self.key(node)) && !self.features.auto_create {
            return Err(Error::Directory("item-not-found".to_string()));
        }
        let node = nodes.entry(self.key(node)).or_default();
        if let Some(options) = options {
            node.config = Some(options.clone());
        }
        node.items.retain(|existing| existing.id != item.id);
        node.items.push(item);

        if let Some(ItemLimit::Count(max)) = node.config.as_ref().and_then(|config| config.max_items) {
            let max = max as usize;
            if node.items.len() > max {
                let excess = node.items.len() - max;
                node.items.drain(..excess);
            }
        }
        Ok(())
    }

    async fn retract_own_item(&self, node: &str, item_id: &str) -> Result<()> {
        let mut nodes = self.server.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(&self.key(node)) {
            node.items.retain(|item| item.id != item_id);
        }
        Ok(())
    }

    async fn delete_own_node(&self, node: &str) -> Result<()> {
        self.server.nodes.lock().unwrap().remove(&self.key(node));
        Ok(())
    }

    async fn request_items(&self, jid: &str, node: &str) -> Result<Vec<PubSubItem>> {
        Ok(self.server.items(jid, node))
    }

    async fn request_item(&self, jid: &str, node: &str, item_id: &str) -> Result<PubSubItem> {
        self.server
            .items(jid, node)
            .into_iter()
            .find(|item| item.id == item_id)
            .ok_or_else(|| Error::Directory("item-not-found".to_string()))
    }

    async fn request_item_ids(&self, jid: &str, node: &str) -> Result<Vec<String>> {
        Ok(self.server.items(jid, node).into_iter().map(|item| item.id).collect())
    }

    async fn subscribe(&self, jid: &str, _node: &str) -> Result<()> {
        self.server
            .subscriptions
            .lock()
            .unwrap()
            .entry(self.jid.clone())
            .or_default()
            .insert(jid.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, jid: &str, _node: &str) -> Result<()> {
        if let Some(jids) = self.server.subscriptions.lock().unwrap().get_mut(&self.jid) {
            jids.remove(jid);
        }
        Ok(())
    }
}

/// Wraps a directory so that one bundle fetch can be held until the test
/// releases it.
pub struct GatedDirectory {
    inner: Arc<dyn DeviceDirectory>,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl GatedDirectory {
    pub fn new(inner: Arc<dyn DeviceDirectory>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            armed: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        })
    }

    /// Holds the next `fetch_bundle` call.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub async fn wait_until_reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl DeviceDirectory for GatedDirectory {
    async fn fetch_bundle(&self, jid: &str, device_id: u32) -> Result<DeviceBundle> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.fetch_bundle(jid, device_id).await
    }

    async fn fetch_device_list(&self, jid: &str) -> Result<Vec<DeviceListItem>> {
        self.inner.fetch_device_list(jid).await
    }

    async fn own_bundle_ids(&self) -> Result<Vec<u32>> {
        self.inner.own_bundle_ids().await
    }

    async fn publish_own_bundle(&self, device_id: u32, bundle: &DeviceBundle) -> Result<()> {
        self.inner.publish_own_bundle(device_id, bundle).await
    }

    async fn retract_own_bundle(&self, device_id: u32) -> Result<()> {
        self.inner.retract_own_bundle(device_id).await
    }

    async fn delete_own_bundles(&self) -> Result<()> {
        self.inner.delete_own_bundles().await
    }

    async fn publish_own_device_list(&self, devices: &[DeviceListEntry]) -> Result<()> {
        self.inner.publish_own_device_list(devices).await
    }

    async fn delete_own_device_list(&self) -> Result<()> {
        self.inner.delete_own_device_list().await
    }

    async fn subscribe(&self, jid: &str) -> Result<()> {
        self.inner.subscribe(jid).await
    }

    async fn unsubscribe(&self, jid: &str) -> Result<()> {
        self.inner.unsubscribe(jid).await
    }
}

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutgoingMessage>>,
}

impl RecordingSender {
    pub fn take(&self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl StanzaSender for RecordingSender {
    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

pub struct TestClient {
    pub jid: String,
    pub manager: OmemoManager,
    pub sender: Arc<RecordingSender>,
    pub trust: Arc<MemoryTrustStore>,
    pub storage: Arc<InMemoryStorage>,
    pub events: Receiver<OmemoEvent>,
}

impl TestClient {
    /// A client that has not been set up yet.
    pub fn new(server: &Arc<PepServer>, jid: &str, config: OmemoConfig) -> Self {
        Self::with_storage(server, jid, config, Arc::new(InMemoryStorage::new()), full_features())
    }

    pub fn with_storage(
        server: &Arc<PepServer>,
        jid: &str,
        config: OmemoConfig,
        storage: Arc<InMemoryStorage>,
        features: PepFeatures,
    ) -> Self {
        let directory = Arc::new(PepDirectory::new(PepClient::new(server.clone(), jid, features), jid));
        Self::with_directory(jid, config, storage, directory)
    }

    pub fn with_directory(
        jid: &str,
        config: OmemoConfig,
        storage: Arc<InMemoryStorage>,
        directory: Arc<dyn DeviceDirectory>,
    ) -> Self {
        let sender = Arc::new(RecordingSender::default());
        let trust = Arc::new(MemoryTrustStore::with_policy(SecurityPolicy::Toakafa));
        let (events_tx, events) = crossbeam_channel::unbounded();
        let services = OmemoServices {
            engine: Arc::new(SimulatedRatchet),
            trust: trust.clone(),
            directory,
            sender: sender.clone(),
        };
        let manager = OmemoManager::new(
            jid,
            services,
            Some(storage.clone() as Arc<dyn StorageAdapter>),
            config,
            Some(events_tx),
        )
        .unwrap();
        Self {
            jid: jid.to_string(),
            manager,
            sender,
            trust,
            storage,
            events,
        }
    }

    /// A client with a freshly set up device.
    pub async fn set_up(server: &Arc<PepServer>, jid: &str) -> Self {
        Self::set_up_with_config(server, jid, OmemoConfig::default()).await
    }

    pub async fn set_up_with_config(server: &Arc<PepServer>, jid: &str, config: OmemoConfig) -> Self {
        let client = Self::new(server, jid, config);
        client.manager.set_up().await.unwrap();
        client
    }

    pub async fn device_id(&self) -> u32 {
        self.manager.own_device_id().await
    }

    pub fn drain_events(&self) -> Vec<OmemoEvent> {
        self.events.try_iter().collect()
    }
}

/// Hands every message `from` sent so far to the recipients it was addressed
/// to and returns what they made of it.
pub async fn deliver(from: &TestClient, recipients: &[&TestClient]) -> Vec<DecryptOutcome> {
    let mut outcomes = Vec::new();
    for message in from.sender.take() {
        for recipient in recipients.iter().filter(|client| client.jid == message.to) {
            outcomes.push(
                recipient
                    .manager
                    .decrypt_message(&from.jid, &message.element)
                    .await
                    .unwrap(),
            );
        }
    }
    outcomes
}

pub fn jids(jids: &[&str]) -> Vec<String> {
    jids.iter().map(|jid| jid.to_string()).collect()
}

pub fn content(outcome: &DecryptOutcome) -> &str {
    match outcome {
        DecryptOutcome::Decrypted(content) => &content.content,
        other => panic!("expected decrypted content, got {other:?}"),
    }
}
