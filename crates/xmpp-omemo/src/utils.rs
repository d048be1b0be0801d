use crate::{DEVICE_ID_MAX, DEVICE_ID_MIN};
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Picks a device id that none of `taken` uses.
pub fn random_device_id(taken: &[u32]) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.gen_range(DEVICE_ID_MIN..=DEVICE_ID_MAX);
        if !taken.contains(&id) {
            return id;
        }
    }
}

/// First id of a block of `count` ids following `latest`, wrapping to `min`
/// when the block would exceed `max`.
pub fn next_id_block(latest: u32, count: u32, min: u32, max: u32) -> u32 {
    match latest.checked_add(count) {
        Some(end) if end <= max => latest + 1,
        _ => min,
    }
}

pub fn key_id_hex(key_id: &[u8]) -> String {
    hex::encode(key_id)
}
