use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::auth::sigv4::hex_encode;

static ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Random RFC 4122 v4 identifier, used for request and attempt ids.
pub fn generate_uuid() -> String {
    let mut bytes = [0u8; 16];
    if getrandom::fill(&mut bytes).is_err() {
        let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        bytes[..8].copy_from_slice(&(ts_ms as u64).to_be_bytes());
        bytes[8..].copy_from_slice(&seq.to_be_bytes());
    }
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex = hex_encode(&bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Uniform index in `0..len`. `len` must be non-zero.
pub fn random_index(len: usize) -> usize {
    debug_assert!(len > 0);
    let mut bytes = [0u8; 8];
    let value = if getrandom::fill(&mut bytes).is_ok() {
        u64::from_le_bytes(bytes)
    } else {
        ID_SEQ.fetch_add(1, Ordering::Relaxed)
    };
    (value % len.max(1) as u64) as usize
}

pub fn is_uuid(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    bytes.iter().enumerate().all(|(idx, byte)| match idx {
        8 | 13 | 18 | 23 => *byte == b'-',
        _ => byte.is_ascii_hexdigit(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uuids_are_well_formed_and_distinct() {
        let a = generate_uuid();
        let b = generate_uuid();
        assert!(is_uuid(&a), "{a}");
        assert!(is_uuid(&b), "{b}");
        assert_ne!(a, b);
        assert_eq!(&a[14..15], "4");
    }

    #[test]
    fn random_index_stays_in_range() {
        for _ in 0..64 {
            assert!(random_index(3) < 3);
        }
        assert_eq!(random_index(1), 0);
    }
}
