use crate::scheduler::LifecycleScheduler;
use crate::trust::level_for_new_key;
use crate::utils::{now_secs, random_device_id};
use crate::{
    DeviceBundle, DeviceDirectory, DeviceListEntry, DeviceRegistry, Error, IdentityKeyStore,
    InMemoryStorage, KeyMaterialStore, OmemoConfig, OmemoElement, OmemoEnvelope, OmemoEvent,
    OmemoStorage, OutgoingMessage, PreKeyStore, ProtocolAddress, RatchetEngine, RatchetStores,
    Result, SecurityPolicy, SessionBundle, SessionStore, SignedPreKeyStore, StanzaSender,
    StorageAdapter, TrustGate, TrustLevel, TrustLevels, PROBE_SECRET_SIZE,
};
use rand::seq::IteratorRandom;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// External collaborators of the manager.
pub struct OmemoServices {
    pub engine: Arc<dyn RatchetEngine>,
    pub trust: Arc<dyn TrustGate>,
    pub directory: Arc<dyn DeviceDirectory>,
    pub sender: Arc<dyn StanzaSender>,
}

pub(crate) struct ManagerState {
    pub(crate) keys: KeyMaterialStore,
    pub(crate) devices: DeviceRegistry,
    pub(crate) accepted_session_building_trust_levels: TrustLevels,
    pub(crate) new_device_auto_session_building: bool,
    /// JIDs whose device lists were subscribed to outside of the roster.
    pub(crate) manually_subscribed_jids: HashSet<String>,
}

impl ManagerState {
    pub(crate) fn stores(&mut self) -> StoreContext<'_> {
        StoreContext {
            keys: &mut self.keys,
            devices: &mut self.devices,
        }
    }

    pub(crate) fn own_device_id(&self) -> u32 {
        self.keys.own_device().id
    }

    /// Device list entries of the own account: this device first, then every
    /// other own device still on the list.
    pub(crate) fn own_device_list(&self, own_jid: &str) -> Vec<DeviceListEntry> {
        let own = self.keys.own_device();
        let mut entries = vec![DeviceListEntry::new(own.id, own.label.clone())];
        entries.extend(
            self.devices
                .devices_of(own_jid)
                .filter(|(id, device)| *id != own.id && device.removal_timestamp.is_none())
                .map(|(id, device)| DeviceListEntry::new(id, device.label.clone())),
        );
        entries
    }
}

/// The capability stores of one ratchet call.
pub(crate) struct StoreContext<'a> {
    keys: &'a mut KeyMaterialStore,
    devices: &'a mut DeviceRegistry,
}

impl RatchetStores for StoreContext<'_> {
    fn identity(&self) -> &dyn IdentityKeyStore {
        &*self.keys
    }

    fn pre_keys(&mut self) -> &mut dyn PreKeyStore {
        &mut *self.keys
    }

    fn signed_pre_keys(&mut self) -> &mut dyn SignedPreKeyStore {
        &mut *self.keys
    }

    fn sessions(&mut self) -> &mut dyn SessionStore {
        &mut *self.devices
    }
}

pub(crate) struct ManagerInner {
    pub(crate) own_jid: String,
    pub(crate) config: OmemoConfig,
    pub(crate) engine: Arc<dyn RatchetEngine>,
    pub(crate) trust: Arc<dyn TrustGate>,
    pub(crate) directory: Arc<dyn DeviceDirectory>,
    pub(crate) sender: Arc<dyn StanzaSender>,
    pub(crate) storage: OmemoStorage,
    pub(crate) state: Mutex<ManagerState>,
    is_started: AtomicBool,
    events: Option<crossbeam_channel::Sender<OmemoEvent>>,
    scheduler: Mutex<Option<LifecycleScheduler>>,
}

/// Orchestrates OMEMO for one account: key material, sessions with every
/// device of every contact, fan-out encryption and decryption.
///
/// The handle is cheap to clone. All clones share the same state.
#[derive(Clone)]
pub struct OmemoManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl OmemoManager {
    pub fn new(
        own_jid: impl Into<String>,
        services: OmemoServices,
        storage: Option<Arc<dyn StorageAdapter>>,
        config: OmemoConfig,
        events: Option<crossbeam_channel::Sender<OmemoEvent>>,
    ) -> Result<Self> {
        config.validate()?;
        let storage = OmemoStorage::new(
            storage.unwrap_or_else(|| Arc::new(InMemoryStorage::new()) as Arc<dyn StorageAdapter>),
        );
        let state = ManagerState {
            keys: KeyMaterialStore::new(services.engine.clone(), storage.clone()),
            devices: DeviceRegistry::new(
                storage.clone(),
                config.unresponded_sent_limit,
                config.unresponded_received_limit,
            ),
            accepted_session_building_trust_levels: config.accepted_session_building_trust_levels,
            new_device_auto_session_building: config.new_device_auto_session_building,
            manually_subscribed_jids: HashSet::new(),
        };

        Ok(Self {
            inner: Arc::new(ManagerInner {
                own_jid: own_jid.into(),
                config,
                engine: services.engine,
                trust: services.trust,
                directory: services.directory,
                sender: services.sender,
                storage,
                state: Mutex::new(state),
                is_started: AtomicBool::new(false),
                events,
                scheduler: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub fn own_jid(&self) -> &str {
        &self.inner.own_jid
    }

    pub fn config(&self) -> &OmemoConfig {
        &self.inner.config
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_started.load(Ordering::Acquire)
    }

    pub(crate) async fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().await
    }

    pub(crate) fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    pub(crate) fn emit(&self, event: OmemoEvent) {
        if let Some(events) = &self.inner.events {
            if events.send(event).is_err() {
                debug!("OMEMO event receiver dropped");
            }
        }
    }

    pub async fn own_device_id(&self) -> u32 {
        self.state().await.own_device_id()
    }

    pub async fn own_key(&self) -> Vec<u8> {
        self.state().await.keys.own_device().public_identity_key.clone()
    }

    pub async fn own_device_label(&self) -> Option<String> {
        self.state().await.keys.own_device().label.clone()
    }

    /// Sets up a new OMEMO device: key material, bundle and device list
    /// entry. Storage is rolled back if any step fails.
    pub async fn set_up(&self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }

        if let Err(e) = self.set_up_device().await {
            warn!(error = %e, "OMEMO setup failed, rolling back");
            self.inner.storage.reset_all()?;
            let mut state = self.state().await;
            state.keys.reset();
            state.devices.reset();
            return Err(e);
        }

        self.inner.is_started.store(true, Ordering::Release);
        self.start_scheduler().await;
        info!(jid = %self.inner.own_jid, "OMEMO device set up");
        Ok(())
    }

    async fn set_up_device(&self) -> Result<()> {
        let taken = self.inner.directory.own_bundle_ids().await?;
        let device_id = random_device_id(&taken);

        let (bundle, own_key) = {
            let mut state = self.state().await;
            state.keys.set_device_id(device_id);
            state.keys.generate_identity()?;
            state.keys.rotate_signed_pre_key(now_secs())?;
            state.keys.replenish_pre_keys(self.inner.config.pre_key_pool_size)?;
            state.keys.save_own_device()?;
            state.keys.take_bundle_changed();
            (
                state.keys.bundle().clone(),
                state.keys.own_device().public_identity_key.clone(),
            )
        };
        self.inner.trust.set_own_key(&own_key).await?;

        let own_jid = self.inner.own_jid.clone();
        let items = self.inner.directory.fetch_device_list(&own_jid).await?;
        if let Some(entries) = self.select_device_list(&own_jid, items) {
            self.update_devices(&own_jid, entries).await?;
        }

        self.inner
            .directory
            .publish_own_bundle(device_id, &bundle)
            .await?;
        self.publish_own_device_list().await
    }

    /// Restores a device set up earlier. Returns `false` if no complete key
    /// material is stored.
    pub async fn load(&self) -> Result<bool> {
        let data = self.inner.storage.all_data()?;
        let Some(keys) = KeyMaterialStore::restore(
            self.inner.engine.clone(),
            self.inner.storage.clone(),
            data.own_device,
            data.signed_pre_key_pairs,
            data.pre_key_pairs,
        ) else {
            return Ok(false);
        };

        {
            let mut state = self.state().await;
            state.keys = keys;
            state.devices.restore(data.devices);
        }
        self.inner.is_started.store(true, Ordering::Release);

        if let Err(e) = self.renew_signed_pre_key_pairs().await {
            warn!(error = %e, "signed pre key renewal after load failed");
        }
        if let Err(e) = self.prune_absent_devices().await {
            warn!(error = %e, "device pruning after load failed");
        }
        self.start_scheduler().await;
        Ok(true)
    }

    /// Removes this device from the own device list and the bundles node and
    /// deletes all local OMEMO data.
    pub async fn reset_own_device(&self) -> Result<()> {
        let (device_id, others) = {
            let state = self.state().await;
            let device_id = state.own_device_id();
            let others: Vec<DeviceListEntry> = state
                .own_device_list(&self.inner.own_jid)
                .into_iter()
                .filter(|entry| entry.id != device_id)
                .collect();
            (device_id, others)
        };

        if others.is_empty() {
            self.inner.directory.delete_own_device_list().await?;
        } else {
            self.inner.directory.publish_own_device_list(&others).await?;
        }

        let bundle_ids = self.inner.directory.own_bundle_ids().await?;
        if bundle_ids.iter().all(|id| *id == device_id) {
            self.inner.directory.delete_own_bundles().await?;
        } else {
            self.inner.directory.retract_own_bundle(device_id).await?;
        }

        self.clear_local_data().await?;
        info!(device_id, "OMEMO device reset");
        Ok(())
    }

    /// Deletes the own device list and all own bundles, this device's and
    /// every other own device's, and all local OMEMO data.
    pub async fn reset_all(&self) -> Result<()> {
        self.inner.directory.delete_own_device_list().await?;
        self.inner.directory.delete_own_bundles().await?;
        self.clear_local_data().await?;
        info!("all OMEMO data reset");
        Ok(())
    }

    async fn clear_local_data(&self) -> Result<()> {
        self.stop().await;
        self.inner.storage.reset_all()?;
        self.inner.trust.reset_all().await?;
        {
            let mut state = self.state().await;
            state.keys.reset();
            state.devices.reset();
            state.manually_subscribed_jids.clear();
        }
        self.emit(OmemoEvent::AllDevicesRemoved);
        Ok(())
    }

    async fn stop(&self) {
        self.inner.is_started.store(false, Ordering::Release);
        self.inner.scheduler.lock().await.take();
    }

    async fn start_scheduler(&self) {
        let scheduler = LifecycleScheduler::start(Arc::downgrade(&self.inner), &self.inner.config);
        *self.inner.scheduler.lock().await = Some(scheduler);
    }

    /// Changes the label of this device and republishes the device list.
    pub async fn change_device_label(&self, label: Option<String>) -> Result<()> {
        {
            let mut state = self.state().await;
            state.keys.set_label(label);
            if self.is_started() {
                state.keys.save_own_device()?;
            }
        }
        if self.is_started() {
            self.publish_own_device_list().await?;
        }
        Ok(())
    }

    pub async fn set_accepted_session_building_trust_levels(&self, levels: TrustLevels) {
        self.state().await.accepted_session_building_trust_levels = levels;
    }

    pub async fn set_new_device_auto_session_building(&self, enabled: bool) {
        self.state().await.new_device_auto_session_building = enabled;
    }

    pub async fn security_policy(&self) -> Result<SecurityPolicy> {
        self.inner.trust.security_policy().await
    }

    pub async fn set_security_policy(&self, policy: SecurityPolicy) -> Result<()> {
        self.inner.trust.set_security_policy(policy).await
    }

    pub async fn trust_level(&self, jid: &str, key_id: &[u8]) -> Result<TrustLevel> {
        self.inner.trust.trust_level(jid, key_id).await
    }

    pub async fn set_trust_level(&self, keys: &[(String, Vec<u8>)], level: TrustLevel) -> Result<()> {
        self.inner.trust.set_trust_level(keys, level).await
    }

    /// Trust level of a key, assigning one by the security policy if it has
    /// not been decided yet.
    pub(crate) async fn resolve_trust_level(&self, jid: &str, key_id: &[u8]) -> Result<TrustLevel> {
        let trust = &*self.inner.trust;
        let level = trust.trust_level(jid, key_id).await?;
        if level != TrustLevel::Undecided {
            return Ok(level);
        }

        let policy = trust.security_policy().await?;
        let level = level_for_new_key(trust, policy, jid).await?;
        trust.add_keys(jid, &[key_id.to_vec()], level).await?;
        debug!(jid, key_id = %crate::utils::key_id_hex(key_id), ?level, "trust level assigned");
        Ok(level)
    }

    pub(crate) async fn publish_own_bundle(&self) -> Result<()> {
        let (device_id, bundle) = {
            let mut state = self.state().await;
            state.keys.take_bundle_changed();
            (state.own_device_id(), state.keys.bundle().clone())
        };
        self.inner
            .directory
            .publish_own_bundle(device_id, &bundle)
            .await
    }

    pub(crate) async fn publish_own_device_list(&self) -> Result<()> {
        let entries = self.state().await.own_device_list(&self.inner.own_jid);
        self.inner.directory.publish_own_device_list(&entries).await
    }

    /// Records the key of a device, creating the device if needed. Only a
    /// received stanza may create a device this way. Returns whether the key
    /// changed.
    pub(crate) async fn store_key_id(&self, jid: &str, device_id: u32, key_id: &[u8]) -> Result<bool> {
        let added = {
            let mut state = self.state().await;
            let added = !state.devices.contains(jid, device_id);
            let device = state.devices.get_or_insert(jid, device_id);
            if device.key_id == key_id {
                return Ok(false);
            }
            device.key_id = key_id.to_vec();
            state.devices.save(jid, device_id)?;
            added
        };

        let jid = jid.to_string();
        if added {
            self.emit(OmemoEvent::DeviceAdded { jid, device_id });
        } else {
            self.emit(OmemoEvent::DeviceChanged { jid, device_id });
        }
        Ok(true)
    }

    /// Records the key of a device that is still known. Returns `false` if
    /// the device was removed in the meantime.
    pub(crate) async fn update_key_id(&self, jid: &str, device_id: u32, key_id: &[u8]) -> Result<bool> {
        let mut changed = false;
        let known = self.state().await.devices.update(jid, device_id, |device| {
            if device.key_id != key_id {
                device.key_id = key_id.to_vec();
                changed = true;
            }
        })?;
        if changed {
            self.emit(OmemoEvent::DeviceChanged {
                jid: jid.to_string(),
                device_id,
            });
        }
        Ok(known)
    }

    /// Builds a session from `bundle` with a randomly chosen pre-key.
    pub(crate) async fn build_session(&self, jid: &str, device_id: u32, bundle: &DeviceBundle) -> Result<()> {
        let session_bundle = session_bundle(bundle, device_id)
            .ok_or_else(|| Error::Ratchet(format!("bundle of {jid}.{device_id} is not usable")))?;

        let mut state = self.state().await;
        if !state.devices.contains(jid, device_id) {
            return Err(Error::Ratchet(format!("device {jid}.{device_id} was removed")));
        }
        let address = ProtocolAddress::new(jid, device_id);
        self.inner
            .engine
            .build_session(&mut state.stores(), &address, &session_bundle)?;
        debug!(%address, pre_key_id = session_bundle.pre_key_id, "session built");
        Ok(())
    }

    /// Fetches the bundle of a device, decides its trust and builds a session
    /// if the trust level allows it, then completes the key exchange with an
    /// empty message. Returns whether a session was built.
    pub(crate) async fn build_session_with_device_bundle(&self, jid: &str, device_id: u32) -> Result<bool> {
        let bundle = self.inner.directory.fetch_bundle(jid, device_id).await?;
        if !self.update_key_id(jid, device_id, &bundle.identity_key).await? {
            debug!(jid, device_id, "session not built, device was removed");
            return Ok(false);
        }

        let level = self.resolve_trust_level(jid, &bundle.identity_key).await?;
        let accepted = self.state().await.accepted_session_building_trust_levels;
        if !accepted.contains(level) {
            debug!(jid, device_id, ?level, "session not built, trust level not accepted");
            return Ok(false);
        }

        self.build_session(jid, device_id, &bundle).await?;
        self.send_empty_message(jid, device_id).await?;
        Ok(true)
    }

    /// Sends a message without payload to one device. It completes a key
    /// exchange or answers received stanzas as a heartbeat.
    pub(crate) async fn send_empty_message(&self, jid: &str, device_id: u32) -> Result<()> {
        let element = {
            let mut state = self.state().await;
            if !state.devices.contains(jid, device_id) {
                return Ok(());
            }
            let address = ProtocolAddress::new(jid, device_id);
            let message = self.inner.engine.encrypt_for(
                &mut state.stores(),
                &address,
                &[0u8; PROBE_SECRET_SIZE],
            )?;
            let mut element = OmemoElement::new(state.own_device_id());
            element.add_envelope(
                jid,
                OmemoEnvelope {
                    recipient_device_id: device_id,
                    is_key_exchange: message.is_key_exchange,
                    data: message.data,
                },
            );
            element
        };

        self.inner
            .sender
            .send(OutgoingMessage::new(jid, element))
            .await
            .map_err(|e| Error::Delivery(format!("empty message to {jid}.{device_id}: {e}")))
    }
}

/// Reduces a bundle to one of its pre-keys, chosen uniformly at random.
pub(crate) fn session_bundle(bundle: &DeviceBundle, device_id: u32) -> Option<SessionBundle> {
    if !bundle.is_usable() {
        return None;
    }
    let (pre_key_id, pre_key) = bundle.pre_keys.iter().choose(&mut rand::thread_rng())?;
    Some(SessionBundle {
        registration_id: device_id,
        identity_key: bundle.identity_key.clone(),
        signed_pre_key_id: bundle.signed_pre_key_id,
        signed_pre_key: bundle.signed_pre_key.clone(),
        signed_pre_key_signature: bundle.signed_pre_key_signature.clone(),
        pre_key_id: *pre_key_id,
        pre_key: pre_key.clone(),
    })
}
