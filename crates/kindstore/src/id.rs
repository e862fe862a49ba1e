//! Globally unique, creation-ordered record ids.
//!
//! An id is 12 bytes rendered as 20 characters of lowercase base32hex
//! (`0-9a-v`):
//!
//! ```text
//! | 4 bytes unix seconds (BE) | 5 bytes process nonce | 3 bytes counter (BE) |
//! ```
//!
//! The counter is seeded randomly per process and incremented atomically,
//! so ids minted in one process sort by creation order and ids from
//! different processes do not collide.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::Utc;

/// Length of the textual id.
pub const ID_LEN: usize = 20;

const RAW_LEN: usize = 12;
const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

struct Seed {
    nonce: [u8; 5],
    counter: AtomicU32,
}

fn seed() -> &'static Seed {
    static SEED: OnceLock<Seed> = OnceLock::new();
    SEED.get_or_init(|| {
        let random = uuid::Uuid::new_v4();
        let bytes = random.as_bytes();
        let mut nonce = [0u8; 5];
        nonce.copy_from_slice(&bytes[..5]);
        let start = u32::from_be_bytes([0, bytes[5], bytes[6], bytes[7]]);
        Seed {
            nonce,
            counter: AtomicU32::new(start),
        }
    })
}

/// Mint a fresh id.
pub fn new_id() -> String {
    let seed = seed();
    let secs = Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
    let count = seed.counter.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;

    let mut raw = [0u8; RAW_LEN];
    raw[..4].copy_from_slice(&secs.to_be_bytes());
    raw[4..9].copy_from_slice(&seed.nonce);
    raw[9..].copy_from_slice(&count.to_be_bytes()[1..]);
    encode(&raw)
}

/// Check that `text` has the shape of a minted id.
pub fn is_valid_id(text: &str) -> bool {
    text.len() == ID_LEN && text.bytes().all(|b| ALPHABET.contains(&b))
}

fn encode(raw: &[u8; RAW_LEN]) -> String {
    // 96 bits -> 20 digits of 5 bits; the final digit carries 1 bit of padding.
    let mut out = String::with_capacity(ID_LEN);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for byte in raw {
        buffer = (buffer << 8) | u32::from(*byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}
