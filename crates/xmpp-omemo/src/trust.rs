use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustLevel {
    Undecided,
    AutomaticallyDistrusted,
    AutomaticallyTrusted,
    ManuallyDistrusted,
    ManuallyTrusted,
    Authenticated,
}

impl TrustLevel {
    const ALL: [TrustLevel; 6] = [
        TrustLevel::Undecided,
        TrustLevel::AutomaticallyDistrusted,
        TrustLevel::AutomaticallyTrusted,
        TrustLevel::ManuallyDistrusted,
        TrustLevel::ManuallyTrusted,
        TrustLevel::Authenticated,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Set of trust levels, e.g. the levels a device's key must have to receive
/// an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<TrustLevel>", into = "Vec<TrustLevel>")]
pub struct TrustLevels(u8);

impl TrustLevels {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, level: TrustLevel) -> bool {
        self.0 & level.bit() != 0
    }

    pub fn insert(&mut self, level: TrustLevel) {
        self.0 |= level.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = TrustLevel> + '_ {
        TrustLevel::ALL.into_iter().filter(|level| self.contains(*level))
    }
}

impl Default for TrustLevels {
    fn default() -> Self {
        [
            TrustLevel::AutomaticallyTrusted,
            TrustLevel::ManuallyTrusted,
            TrustLevel::Authenticated,
        ]
        .into_iter()
        .collect()
    }
}

impl FromIterator<TrustLevel> for TrustLevels {
    fn from_iter<I: IntoIterator<Item = TrustLevel>>(iter: I) -> Self {
        let mut levels = Self::empty();
        for level in iter {
            levels.insert(level);
        }
        levels
    }
}

impl From<Vec<TrustLevel>> for TrustLevels {
    fn from(levels: Vec<TrustLevel>) -> Self {
        levels.into_iter().collect()
    }
}

impl From<TrustLevels> for Vec<TrustLevel> {
    fn from(levels: TrustLevels) -> Self {
        levels.iter().collect()
    }
}

/// Governs the trust level assigned to a newly observed key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityPolicy {
    #[default]
    NoSecurityPolicy,
    /// Trust on first use, then require manual authentication.
    Toakafa,
}

/// Trust decisions about other devices' keys.
///
/// Keys are identified by their owner's bare JID and the public identity key.
#[async_trait]
pub trait TrustGate: Send + Sync {
    async fn security_policy(&self) -> Result<SecurityPolicy>;
    async fn set_security_policy(&self, policy: SecurityPolicy) -> Result<()>;

    /// Returns `Undecided` for unknown keys.
    async fn trust_level(&self, jid: &str, key_id: &[u8]) -> Result<TrustLevel>;

    /// Sets the level of every `(jid, key id)` pair, adding unknown ones.
    async fn set_trust_level(&self, keys: &[(String, Vec<u8>)], level: TrustLevel) -> Result<()>;

    async fn add_keys(&self, jid: &str, key_ids: &[Vec<u8>], level: TrustLevel) -> Result<()>;

    /// Whether `jid` owns at least one key with the given level.
    async fn has_key(&self, jid: &str, level: TrustLevel) -> Result<bool>;

    async fn remove_keys(&self, jid: &str, key_ids: &[Vec<u8>]) -> Result<()>;
    async fn remove_owner(&self, jid: &str) -> Result<()>;
    async fn set_own_key(&self, key_id: &[u8]) -> Result<()>;
    async fn own_key(&self) -> Result<Option<Vec<u8>>>;
    async fn reset_all(&self) -> Result<()>;
}

#[derive(Default)]
struct TrustState {
    policy: SecurityPolicy,
    own_key: Option<Vec<u8>>,
    keys: HashMap<String, HashMap<Vec<u8>, TrustLevel>>,
}

/// In-memory `TrustGate`.
#[derive(Default)]
pub struct MemoryTrustStore {
    state: Mutex<TrustState>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: SecurityPolicy) -> Self {
        Self {
            state: Mutex::new(TrustState {
                policy,
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl TrustGate for MemoryTrustStore {
    async fn security_policy(&self) -> Result<SecurityPolicy> {
        Ok(self.state.lock().await.policy)
    }

    async fn set_security_policy(&self, policy: SecurityPolicy) -> Result<()> {
        self.state.lock().await.policy = policy;
        Ok(())
    }

    async fn trust_level(&self, jid: &str, key_id: &[u8]) -> Result<TrustLevel> {
        let state = self.state.lock().await;
        Ok(state
            .keys
            .get(jid)
            .and_then(|keys| keys.get(key_id))
            .copied()
            .unwrap_or(TrustLevel::Undecided))
    }

    async fn set_trust_level(&self, keys: &[(String, Vec<u8>)], level: TrustLevel) -> Result<()> {
        let mut state = self.state.lock().await;
        for (jid, key_id) in keys {
            state
                .keys
                .entry(jid.clone())
                .or_default()
                .insert(key_id.clone(), level);
        }
        Ok(())
    }

    async fn add_keys(&self, jid: &str, key_ids: &[Vec<u8>], level: TrustLevel) -> Result<()> {
        let mut state = self.state.lock().await;
        let keys = state.keys.entry(jid.to_string()).or_default();
        for key_id in key_ids {
            keys.insert(key_id.clone(), level);
        }
        Ok(())
    }

    async fn has_key(&self, jid: &str, level: TrustLevel) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .keys
            .get(jid)
            .is_some_and(|keys| keys.values().any(|l| *l == level)))
    }

    async fn remove_keys(&self, jid: &str, key_ids: &[Vec<u8>]) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(keys) = state.keys.get_mut(jid) {
            for key_id in key_ids {
                keys.remove(key_id);
            }
            if keys.is_empty() {
                state.keys.remove(jid);
            }
        }
        Ok(())
    }

    async fn remove_owner(&self, jid: &str) -> Result<()> {
        self.state.lock().await.keys.remove(jid);
        Ok(())
    }

    async fn set_own_key(&self, key_id: &[u8]) -> Result<()> {
        self.state.lock().await.own_key = Some(key_id.to_vec());
        Ok(())
    }

    async fn own_key(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().await.own_key.clone())
    }

    async fn reset_all(&self) -> Result<()> {
        *self.state.lock().await = TrustState::default();
        Ok(())
    }
}

/// Level a newly observed key of `jid` receives under `policy`.
pub(crate) async fn level_for_new_key(
    trust: &dyn TrustGate,
    policy: SecurityPolicy,
    jid: &str,
) -> Result<TrustLevel> {
    Ok(match policy {
        SecurityPolicy::NoSecurityPolicy => TrustLevel::AutomaticallyDistrusted,
        SecurityPolicy::Toakafa => {
            if trust.has_key(jid, TrustLevel::Authenticated).await? {
                TrustLevel::AutomaticallyDistrusted
            } else {
                TrustLevel::AutomaticallyTrusted
            }
        }
    })
}
