use crate::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

const RPAD_SIZE_MIN: usize = 0;
const RPAD_SIZE_MAX: usize = 200;

/// Structured plaintext encrypted as the shared payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEnvelope {
    pub timestamp: u64,
    pub from: String,
    pub to: String,
    /// Random padding hiding the content length.
    pub rpad: String,
    pub content: String,
}

impl ContentEnvelope {
    pub fn new(from: impl Into<String>, to: impl Into<String>, content: impl Into<String>) -> Self {
        let mut rng = rand::thread_rng();
        let rpad_len = rng.gen_range(RPAD_SIZE_MIN..=RPAD_SIZE_MAX);
        let rpad = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(rpad_len)
            .map(char::from)
            .collect();

        Self {
            timestamp: crate::utils::now_secs(),
            from: from.into(),
            to: to.into(),
            rpad,
            content: content.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
