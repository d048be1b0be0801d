use crate::content::ContentEnvelope;
use crate::payload::PayloadCipher;
use crate::{
    EncryptError, Error, OmemoElement, OmemoEnvelope, OmemoManager, ProtocolAddress, Result,
    TrustLevels,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    /// The device did not answer the stanzas sent to it.
    Unresponsive,
    /// The trust level of the device's key is not accepted.
    Untrusted,
    Failed,
}

#[derive(Debug)]
enum DeviceOutcome {
    Encrypted { jid: String, envelope: OmemoEnvelope },
    Skipped(SkipReason),
}

/// Collects the outcomes of concurrently encrypted devices. The task that
/// stores the last outcome hands all of them over.
struct FanOut {
    total: usize,
    processed: AtomicUsize,
    outcomes: Mutex<Vec<DeviceOutcome>>,
    done: Mutex<Option<oneshot::Sender<Vec<DeviceOutcome>>>>,
}

impl FanOut {
    async fn record(&self, outcome: DeviceOutcome) {
        self.outcomes.lock().await.push(outcome);
        if self.processed.fetch_add(1, Ordering::AcqRel) + 1 == self.total {
            let outcomes = std::mem::take(&mut *self.outcomes.lock().await);
            if let Some(done) = self.done.lock().await.take() {
                let _ = done.send(outcomes);
            }
        }
    }
}

impl OmemoManager {
    /// Encrypts `content` for every accepted device of `recipient_jids` and
    /// of the own account.
    ///
    /// The content is encrypted once. Only its key is encrypted per device.
    /// Devices that cannot be encrypted for are skipped, the call fails only
    /// if no device remains.
    pub async fn encrypt_for_recipients(
        &self,
        content: &str,
        recipient_jids: &[String],
        accepted_trust_levels: TrustLevels,
    ) -> Result<OmemoElement> {
        self.ensure_started()?;
        let own_jid = self.inner.own_jid.clone();
        let to = recipient_jids.first().unwrap_or(&own_jid).clone();

        let mut jids: Vec<String> = Vec::with_capacity(recipient_jids.len() + 1);
        for jid in recipient_jids.iter().chain(std::iter::once(&own_jid)) {
            if !jids.contains(jid) {
                jids.push(jid.clone());
            }
        }

        let envelope = ContentEnvelope::new(own_jid.clone(), to, content);
        let payload = PayloadCipher::encrypt(&envelope.to_bytes()?)?;

        let (own_device_id, mut targets) = {
            let state = self.state().await;
            let own_device_id = state.own_device_id();
            let targets: Vec<(String, u32)> = jids
                .iter()
                .flat_map(|jid| {
                    state
                        .devices
                        .devices_of(jid)
                        .filter(|(id, _)| *jid != own_jid || *id != own_device_id)
                        .map(|(id, _)| (jid.clone(), id))
                        .collect::<Vec<_>>()
                })
                .collect();
            (own_device_id, targets)
        };

        let max_devices = self.inner.config.max_devices_per_stanza;
        if targets.len() > max_devices {
            warn!(count = targets.len(), max_devices, "too many recipient devices, truncating");
            targets.truncate(max_devices);
        }
        if targets.is_empty() {
            return Err(EncryptError::NoRecipientDevices.into());
        }

        let (done_tx, done_rx) = oneshot::channel();
        let fan_out = Arc::new(FanOut {
            total: targets.len(),
            processed: AtomicUsize::new(0),
            outcomes: Mutex::new(Vec::with_capacity(targets.len())),
            done: Mutex::new(Some(done_tx)),
        });
        let secret = Arc::new(payload.wrapped_secret);

        for (jid, device_id) in targets {
            let manager = self.clone();
            let fan_out = fan_out.clone();
            let secret = secret.clone();
            tokio::spawn(async move {
                let outcome = manager
                    .encrypt_for_device(jid, device_id, &secret, accepted_trust_levels)
                    .await;
                fan_out.record(outcome).await;
            });
        }
        drop(fan_out);

        let outcomes = done_rx
            .await
            .map_err(|_| Error::Ratchet("device encryption task aborted".to_string()))?;

        let mut element = OmemoElement::new(own_device_id);
        element.payload = payload.ciphertext;
        let mut unresponsive = 0;
        for outcome in outcomes.iter() {
            match outcome {
                DeviceOutcome::Encrypted { jid, envelope } => {
                    element.add_envelope(jid.clone(), envelope.clone())
                }
                DeviceOutcome::Skipped(SkipReason::Unresponsive) => unresponsive += 1,
                DeviceOutcome::Skipped(_) => {}
            }
        }

        if element.envelopes.is_empty() {
            return Err(if unresponsive == outcomes.len() {
                EncryptError::NoRespondingRecipientDevices
            } else {
                EncryptError::NoAcceptedRecipientDevices
            }
            .into());
        }
        Ok(element)
    }

    /// Encrypts the content of a message to `to`.
    pub async fn encrypt_message(
        &self,
        to: &str,
        content: &str,
        accepted_trust_levels: TrustLevels,
    ) -> Result<OmemoElement> {
        self.encrypt_for_recipients(content, &[to.to_string()], accepted_trust_levels)
            .await
    }

    /// Encrypts the content of an IQ request or response to `to`.
    pub async fn encrypt_iq(
        &self,
        to: &str,
        content: &str,
        accepted_trust_levels: TrustLevels,
    ) -> Result<OmemoElement> {
        self.encrypt_for_recipients(content, &[to.to_string()], accepted_trust_levels)
            .await
    }

    async fn encrypt_for_device(
        &self,
        jid: String,
        device_id: u32,
        secret: &[u8],
        accepted_trust_levels: TrustLevels,
    ) -> DeviceOutcome {
        match self
            .try_encrypt_for_device(&jid, device_id, secret, accepted_trust_levels)
            .await
        {
            Ok(Some(envelope)) => DeviceOutcome::Encrypted { jid, envelope },
            Ok(None) => DeviceOutcome::Skipped(SkipReason::Untrusted),
            Err(SkipOrError::Skip(reason)) => DeviceOutcome::Skipped(reason),
            Err(SkipOrError::Error(e)) => {
                debug!(jid, device_id, error = %e, "device skipped");
                DeviceOutcome::Skipped(SkipReason::Failed)
            }
        }
    }

    /// Returns `None` if the device's key is not trusted enough.
    async fn try_encrypt_for_device(
        &self,
        jid: &str,
        device_id: u32,
        secret: &[u8],
        accepted_trust_levels: TrustLevels,
    ) -> std::result::Result<Option<OmemoEnvelope>, SkipOrError> {
        let (key_id, has_session) = {
            let state = self.state().await;
            let Some(device) = state.devices.get(jid, device_id) else {
                return Err(SkipOrError::Skip(SkipReason::Failed));
            };
            if state.devices.is_excluded(device) {
                debug!(jid, device_id, "device skipped, it did not respond for too long");
                return Err(SkipOrError::Skip(SkipReason::Unresponsive));
            }
            (device.key_id.clone(), device.has_session())
        };

        let mut built_session = false;
        if key_id.is_empty() {
            let bundle = self.inner.directory.fetch_bundle(jid, device_id).await?;
            if !self.update_key_id(jid, device_id, &bundle.identity_key).await? {
                debug!(jid, device_id, "device skipped, it was removed meanwhile");
                return Err(SkipOrError::Skip(SkipReason::Failed));
            }
            let level = self.resolve_trust_level(jid, &bundle.identity_key).await?;
            if !accepted_trust_levels.contains(level) {
                debug!(jid, device_id, ?level, "device skipped, trust level not accepted");
                return Ok(None);
            }
            self.build_session(jid, device_id, &bundle).await?;
            built_session = true;
        } else {
            let level = self.resolve_trust_level(jid, &key_id).await?;
            if !accepted_trust_levels.contains(level) {
                debug!(jid, device_id, ?level, "device skipped, trust level not accepted");
                return Ok(None);
            }
            if !has_session {
                let bundle = self.inner.directory.fetch_bundle(jid, device_id).await?;
                if bundle.identity_key != key_id {
                    return Err(SkipOrError::Error(Error::Ratchet(format!(
                        "bundle of {jid}.{device_id} has an unexpected identity key"
                    ))));
                }
                self.build_session(jid, device_id, &bundle).await?;
                built_session = true;
            }
        }

        let mut state = self.state().await;
        if !state.devices.contains(jid, device_id) {
            return Err(SkipOrError::Skip(SkipReason::Failed));
        }
        let address = ProtocolAddress::new(jid, device_id);
        let message = self
            .inner
            .engine
            .encrypt_for(&mut state.stores(), &address, secret)?;
        state.devices.mark_sent(jid, device_id)?;

        Ok(Some(OmemoEnvelope {
            recipient_device_id: device_id,
            is_key_exchange: built_session || message.is_key_exchange,
            data: message.data,
        }))
    }
}

enum SkipOrError {
    Skip(SkipReason),
    Error(Error),
}

impl From<Error> for SkipOrError {
    fn from(e: Error) -> Self {
        SkipOrError::Error(e)
    }
}
