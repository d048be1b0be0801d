//! Device list handling: keeping the registry in line with the device lists
//! published by the own account and by contacts, and keeping the own list
//! correct.

use crate::utils::now_secs;
use crate::{DeviceInfo, DeviceListEntry, DeviceListItem, OmemoEvent, OmemoManager, Result, TrustLevel};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Notification about a change of a device list node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceListEvent {
    /// Items were published.
    Items(Vec<DeviceListItem>),
    /// The item with this id was retracted.
    Retract(String),
    Purge,
    Delete,
}

impl OmemoManager {
    /// Processes a device list notification of `jid`.
    pub async fn handle_device_list_event(&self, jid: &str, event: DeviceListEvent) -> Result<()> {
        self.ensure_started()?;
        match event {
            DeviceListEvent::Items(items) => match self.select_device_list(jid, items) {
                Some(entries) => self.update_devices(jid, entries).await,
                None => self.handle_irregular_device_list_change(jid).await,
            },
            DeviceListEvent::Retract(item_id) => {
                debug!(jid, item_id, "device list item retracted");
                self.handle_irregular_device_list_change(jid).await
            }
            DeviceListEvent::Purge | DeviceListEvent::Delete => {
                self.handle_irregular_device_list_change(jid).await
            }
        }
    }

    /// Picks the device list out of a node's items. The own list is only
    /// accepted as the singleton `current` item. Contacts may use another
    /// item id as long as it is the only item.
    pub(crate) fn select_device_list(&self, jid: &str, items: Vec<DeviceListItem>) -> Option<Vec<DeviceListEntry>> {
        if items.is_empty() {
            return Some(Vec::new());
        }

        if jid == self.inner.own_jid {
            return match items.into_iter().next() {
                Some(item) if item.is_current() => Some(item.devices),
                _ => None,
            };
        }

        if items.len() == 1 {
            return items.into_iter().next().map(|item| item.devices);
        }
        items
            .into_iter()
            .find(DeviceListItem::is_current)
            .map(|item| item.devices)
    }

    /// Replaces the known devices of `jid` with `entries`.
    ///
    /// Devices missing from the list are marked for removal, devices on the
    /// list are added or updated. An own list with duplicates, without this
    /// device or with a wrong label for it is republished.
    pub(crate) async fn update_devices(&self, jid: &str, mut entries: Vec<DeviceListEntry>) -> Result<()> {
        let mut seen = HashSet::new();
        let count = entries.len();
        entries.retain(|entry| seen.insert(entry.id));
        let has_duplicates = entries.len() != count;

        let is_own = jid == self.inner.own_jid;
        if is_own {
            let own_id = self.state().await.own_device_id();
            if let Some(index) = entries.iter().position(|entry| entry.id == own_id) {
                entries[..=index].rotate_right(1);
            }
        }

        let max_devices = self.inner.config.max_devices_per_jid;
        if entries.len() > max_devices {
            warn!(jid, count = entries.len(), max_devices, "device list truncated");
            entries.truncate(max_devices);
        }

        let mut list_incorrect = false;
        let mut events = Vec::new();
        let mut new_devices = Vec::new();
        let auto_session_building = {
            let mut state = self.state().await;

            if is_own {
                let own = state.keys.own_device();
                let (own_id, own_label) = (own.id, own.label.clone());
                match entries.iter().position(|entry| entry.id == own_id) {
                    Some(index) => {
                        let own_entry = entries.remove(index);
                        list_incorrect = has_duplicates || own_entry.label != own_label;
                    }
                    None => list_incorrect = true,
                }
            }

            let now = now_secs();
            let listed: HashSet<u32> = entries.iter().map(|entry| entry.id).collect();
            let absent: Vec<u32> = state
                .devices
                .devices_of(jid)
                .filter(|(id, device)| !listed.contains(id) && device.removal_timestamp.is_none())
                .map(|(id, _)| id)
                .collect();
            for device_id in absent {
                state
                    .devices
                    .update(jid, device_id, |device| device.removal_timestamp = Some(now))?;
                debug!(jid, device_id, "device marked for removal");
            }

            for entry in entries {
                if state.devices.contains(jid, entry.id) {
                    let mut label_changed = false;
                    state.devices.update(jid, entry.id, |device| {
                        device.removal_timestamp = None;
                        if device.label != entry.label {
                            device.label = entry.label.clone();
                            label_changed = true;
                        }
                    })?;
                    if label_changed {
                        events.push(OmemoEvent::DeviceChanged {
                            jid: jid.to_string(),
                            device_id: entry.id,
                        });
                    }
                } else {
                    state.devices.get_or_insert(jid, entry.id).label = entry.label;
                    state.devices.save(jid, entry.id)?;
                    events.push(OmemoEvent::DeviceAdded {
                        jid: jid.to_string(),
                        device_id: entry.id,
                    });
                    new_devices.push(entry.id);
                }
            }

            state.new_device_auto_session_building
        };

        for event in events {
            self.emit(event);
        }

        if auto_session_building {
            for device_id in new_devices {
                if let Err(e) = self.build_session_with_device_bundle(jid, device_id).await {
                    warn!(jid, device_id, error = %e, "session with new device could not be built");
                }
            }
        }

        if is_own && list_incorrect && self.is_started() {
            debug!("own device list is incorrect, republishing");
            self.publish_own_device_list().await?;
        }
        Ok(())
    }

    /// Recovers from a device list change that does not fit the singleton
    /// item convention. The own list is recreated. A contact's devices are
    /// marked for removal until the contact publishes a regular list.
    async fn handle_irregular_device_list_change(&self, jid: &str) -> Result<()> {
        if jid == self.inner.own_jid {
            debug!("own device list changed irregularly, recreating it");
            if let Err(e) = self.inner.directory.delete_own_device_list().await {
                debug!(error = %e, "own device list node could not be deleted");
            }
            return self.publish_own_device_list().await;
        }

        let now = now_secs();
        let mut state = self.state().await;
        let ids: Vec<u32> = state.devices.devices_of(jid).map(|(id, _)| id).collect();
        for device_id in ids {
            state.devices.update(jid, device_id, |device| {
                device.removal_timestamp.get_or_insert(now);
            })?;
        }
        Ok(())
    }

    /// Fetches the device lists of `jids` and updates the known devices.
    pub async fn request_device_lists(&self, jids: &[String]) -> Vec<(String, Result<()>)> {
        let mut results = Vec::with_capacity(jids.len());
        for jid in jids {
            let result = self.request_device_list(jid).await;
            if let Err(e) = &result {
                debug!(jid, error = %e, "device list could not be requested");
            }
            results.push((jid.clone(), result));
        }
        results
    }

    async fn request_device_list(&self, jid: &str) -> Result<()> {
        self.ensure_started()?;
        let items = self.inner.directory.fetch_device_list(jid).await?;
        match self.select_device_list(jid, items) {
            Some(entries) => self.update_devices(jid, entries).await,
            None => self.handle_irregular_device_list_change(jid).await,
        }
    }

    /// Subscribes to the device lists of JIDs whose updates would not arrive
    /// otherwise, e.g. because they are not in the roster.
    pub async fn subscribe_to_device_lists(&self, jids: &[String]) -> Vec<(String, Result<()>)> {
        let mut results = Vec::with_capacity(jids.len());
        for jid in jids {
            let result = self.subscribe_to_device_list(jid).await;
            results.push((jid.clone(), result));
        }
        results
    }

    pub(crate) async fn subscribe_to_device_list(&self, jid: &str) -> Result<()> {
        self.inner.directory.subscribe(jid).await?;
        self.state()
            .await
            .manually_subscribed_jids
            .insert(jid.to_string());
        Ok(())
    }

    pub async fn unsubscribe_from_device_lists(&self, jids: &[String]) -> Vec<(String, Result<()>)> {
        let mut results = Vec::with_capacity(jids.len());
        for jid in jids {
            let result = self.inner.directory.unsubscribe(jid).await;
            if result.is_ok() {
                self.state().await.manually_subscribed_jids.remove(jid);
            }
            results.push((jid.clone(), result));
        }
        results
    }

    /// Makes sure updates of `jid`'s device list arrive and brings the known
    /// devices up to date. Used when a stanza arrives from an unknown device.
    pub(crate) async fn discover_devices(&self, jid: &str) {
        let subscribed = self
            .state()
            .await
            .manually_subscribed_jids
            .contains(jid);
        if !subscribed {
            if let Err(e) = self.subscribe_to_device_list(jid).await {
                warn!(jid, error = %e, "device list subscription failed");
            }
        }
        if let Err(e) = self.request_device_list(jid).await {
            warn!(jid, error = %e, "device list request failed");
        }
    }

    /// Known devices of `jids` with the trust levels of their keys.
    pub async fn devices(&self, jids: &[String]) -> Result<Vec<DeviceInfo>> {
        let mut devices = {
            let state = self.state().await;
            let own_device_id = state.own_device_id();
            let mut devices = Vec::new();
            for jid in jids {
                devices.extend(
                    state
                        .devices
                        .devices_of(jid)
                        .filter(|(id, _)| *jid != self.inner.own_jid || *id != own_device_id)
                        .map(|(id, device)| DeviceInfo {
                            jid: jid.clone(),
                            device_id: id,
                            label: device.label.clone(),
                            key_id: device.key_id.clone(),
                            trust_level: TrustLevel::Undecided,
                            has_session: device.has_session(),
                            removal_timestamp: device.removal_timestamp,
                        }),
                );
            }
            devices
        };

        for device in &mut devices {
            if !device.key_id.is_empty() {
                device.trust_level = self.inner.trust.trust_level(&device.jid, &device.key_id).await?;
            }
        }
        Ok(devices)
    }

    /// The other devices of the own account.
    pub async fn own_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.devices(&[self.inner.own_jid.clone()]).await
    }

    pub async fn contact_devices(&self) -> Result<Vec<DeviceInfo>> {
        let jids: Vec<String> = {
            let state = self.state().await;
            state
                .devices
                .jids()
                .filter(|jid| **jid != self.inner.own_jid)
                .cloned()
                .collect()
        };
        self.devices(&jids).await
    }

    /// Forgets every device of a contact together with the trust in its keys.
    pub async fn remove_contact_devices(&self, jid: &str) -> Result<()> {
        self.state().await.devices.remove_owner(jid)?;
        self.inner.trust.remove_owner(jid).await?;

        let was_subscribed = self.state().await.manually_subscribed_jids.remove(jid);
        if was_subscribed {
            if let Err(e) = self.inner.directory.unsubscribe(jid).await {
                warn!(jid, error = %e, "device list unsubscription failed");
            }
        }

        self.emit(OmemoEvent::DevicesRemoved { jid: jid.to_string() });
        Ok(())
    }

    /// Builds sessions with every known device of `jids` that has none yet.
    pub async fn build_missing_sessions(&self, jids: &[String]) -> Result<()> {
        self.ensure_started()?;
        let missing: Vec<(String, u32)> = {
            let state = self.state().await;
            let own_device_id = state.own_device_id();
            jids.iter()
                .flat_map(|jid| {
                    state
                        .devices
                        .devices_of(jid)
                        .filter(|(id, device)| {
                            !device.has_session() && (*jid != self.inner.own_jid || *id != own_device_id)
                        })
                        .map(|(id, _)| (jid.clone(), id))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (jid, device_id) in missing {
            if let Err(e) = self.build_session_with_device_bundle(&jid, device_id).await {
                warn!(jid, device_id, error = %e, "missing session could not be built");
            }
        }
        Ok(())
    }

    /// Deletes devices that have been absent from their owner's device list
    /// for longer than the removal interval. The trust in their keys is
    /// revoked first.
    pub async fn prune_absent_devices(&self) -> Result<()> {
        self.prune_absent_devices_at(now_secs()).await
    }

    pub async fn prune_absent_devices_at(&self, now: u64) -> Result<()> {
        let interval = self.inner.config.device_removal_interval_secs;
        let expired = self.state().await.devices.expired_devices(now, interval);

        for device in expired {
            if !device.key_id.is_empty() {
                self.inner
                    .trust
                    .remove_keys(&device.jid, &[device.key_id.clone()])
                    .await?;
            }
            self.state().await.devices.remove(&device.jid, device.device_id)?;
            debug!(jid = %device.jid, device_id = device.device_id, "absent device removed");
            self.emit(OmemoEvent::DeviceRemoved {
                jid: device.jid,
                device_id: device.device_id,
            });
        }
        Ok(())
    }

    /// Replaces signed pre-keys older than the renewal interval and
    /// republishes the bundle if one was replaced.
    pub async fn renew_signed_pre_key_pairs(&self) -> Result<()> {
        self.renew_signed_pre_key_pairs_at(now_secs()).await
    }

    pub async fn renew_signed_pre_key_pairs_at(&self, now: u64) -> Result<()> {
        self.ensure_started()?;
        let interval = self.inner.config.signed_pre_key_renewal_interval_secs;
        let renewed = self
            .state()
            .await
            .keys
            .renew_signed_pre_keys(now, interval)?;
        if renewed {
            debug!("signed pre key renewed");
            self.publish_own_bundle().await?;
        }
        Ok(())
    }
}
