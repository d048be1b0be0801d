use crate::content::ContentEnvelope;
use crate::payload::{PayloadCipher, WRAPPED_SECRET_SIZE};
use crate::{
    DecryptError, DecryptOutcome, DecryptedContent, OmemoElement, OmemoEvent, OmemoManager,
    ProtocolAddress, Result, StanzaKind,
};
use tracing::{debug, warn};

impl OmemoManager {
    /// Decrypts the OMEMO element of a message from `sender_jid`.
    pub async fn decrypt_message(&self, sender_jid: &str, element: &OmemoElement) -> Result<DecryptOutcome> {
        self.decrypt_element(sender_jid, element, StanzaKind::Message)
            .await
    }

    /// Decrypts the OMEMO element of an IQ from `sender_jid`.
    pub async fn decrypt_iq(&self, sender_jid: &str, element: &OmemoElement) -> Result<DecryptOutcome> {
        self.decrypt_element(sender_jid, element, StanzaKind::Iq).await
    }

    async fn decrypt_element(
        &self,
        sender_jid: &str,
        element: &OmemoElement,
        kind: StanzaKind,
    ) -> Result<DecryptOutcome> {
        self.ensure_started()?;
        let own_jid = self.inner.own_jid.clone();
        let sender_device_id = element.sender_device_id;

        let (own_device_id, device_known) = {
            let state = self.state().await;
            (
                state.own_device_id(),
                state.devices.contains(sender_jid, sender_device_id),
            )
        };
        let Some(envelope) = element.search_envelope(&own_jid, own_device_id) else {
            debug!(sender_jid, sender_device_id, "element has no envelope for this device");
            return Ok(DecryptOutcome::NotForThisDevice);
        };

        if !device_known && sender_jid != own_jid {
            self.discover_devices(sender_jid).await;
        }

        let address = ProtocolAddress::new(sender_jid, sender_device_id);
        let is_probe = element.is_empty_message();
        let mut answered = false;

        let secret = if envelope.is_key_exchange {
            let (decryption, bundle_changed) = {
                let mut state = self.state().await;
                let decryption = self.inner.engine.decrypt_key_exchange(
                    &mut state.stores(),
                    &address,
                    &envelope.data,
                )?;
                (decryption, state.keys.take_bundle_changed())
            };
            debug!(%address, "key exchange received");

            self.store_key_id(sender_jid, sender_device_id, &decryption.identity_key)
                .await?;
            if bundle_changed {
                if let Err(e) = self.publish_own_bundle().await {
                    warn!(error = %e, "bundle could not be republished after pre key use");
                }
            }
            self.resolve_trust_level(sender_jid, &decryption.identity_key)
                .await?;

            if kind == StanzaKind::Message && !is_probe {
                answered = true;
                if let Err(e) = self.send_empty_message(sender_jid, sender_device_id).await {
                    warn!(%address, error = %e, "key exchange could not be completed");
                }
            }
            decryption.plaintext
        } else {
            let (has_session, added) = {
                let mut state = self.state().await;
                let added = !state.devices.contains(sender_jid, sender_device_id);
                if added {
                    state.devices.get_or_insert(sender_jid, sender_device_id);
                    state.devices.save(sender_jid, sender_device_id)?;
                }
                let has_session = state
                    .devices
                    .get(sender_jid, sender_device_id)
                    .is_some_and(|device| device.has_session());
                (has_session, added)
            };
            if added {
                self.emit(OmemoEvent::DeviceAdded {
                    jid: sender_jid.to_string(),
                    device_id: sender_device_id,
                });
            }
            if !has_session {
                debug!(%address, "no session for received stanza, building one");
                if let Err(e) = self
                    .build_session_with_device_bundle(sender_jid, sender_device_id)
                    .await
                {
                    warn!(%address, error = %e, "session could not be built");
                }
                return Ok(DecryptOutcome::NoSessionYet);
            }

            let mut state = self.state().await;
            let secret = self
                .inner
                .engine
                .decrypt(&mut state.stores(), &address, &envelope.data)?;
            secret
        };

        if is_probe {
            self.state()
                .await
                .devices
                .mark_probe_received(sender_jid, sender_device_id)?;
            debug!(%address, "session confirmed by empty message");
            return Ok(DecryptOutcome::SessionConfirmed);
        }

        let heartbeat_due = self
            .state()
            .await
            .devices
            .mark_responded(sender_jid, sender_device_id)?;
        if heartbeat_due && !answered {
            debug!(%address, "sending heartbeat");
            if let Err(e) = self.send_empty_message(sender_jid, sender_device_id).await {
                warn!(%address, error = %e, "heartbeat could not be sent");
            }
        }

        if secret.len() != WRAPPED_SECRET_SIZE {
            return Err(DecryptError::InvalidPayload(format!(
                "wrapped secret has {} bytes",
                secret.len()
            ))
            .into());
        }
        let plaintext = PayloadCipher::decrypt(&secret, &element.payload)?;
        let envelope = ContentEnvelope::from_bytes(&plaintext)
            .map_err(|e| DecryptError::InvalidPayload(e.to_string()))?;
        if envelope.from != sender_jid {
            warn!(sender_jid, from = %envelope.from, "content envelope sender does not match");
        }

        let sender_key_id = self
            .state()
            .await
            .devices
            .get(sender_jid, sender_device_id)
            .map(|device| device.key_id.clone())
            .unwrap_or_default();

        Ok(DecryptOutcome::Decrypted(DecryptedContent {
            sender_jid: sender_jid.to_string(),
            sender_device_id,
            sender_key_id,
            timestamp: envelope.timestamp,
            to: envelope.to,
            content: envelope.content,
        }))
    }
}
