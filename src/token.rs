//! Idempotency tokens backed by time-ordered UUIDs.
//!
//! A token identifies one logical mutation. Strategies persist a marker key
//! derived from the token id; while the marker exists the mutation is never
//! applied a second time.

use std::env;
use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

use crate::core::CounterError;

/// Entropy source used for token generation.
///
/// Selected once per process from the `SECURE_UUID_MODE` environment
/// variable: `strong` draws from the operating system, `default` from the
/// thread-local generator. Unrecognized values fall back to `Strong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomStrength {
    Strong,
    Default,
}

impl RandomStrength {
    fn from_env() -> Self {
        match env::var("SECURE_UUID_MODE") {
            Ok(value) if value.eq_ignore_ascii_case("default") => RandomStrength::Default,
            _ => RandomStrength::Strong,
        }
    }
}

static MODE: OnceLock<RandomStrength> = OnceLock::new();

/// The entropy mode in use (diagnostic).
pub fn random_strength() -> RandomStrength {
    *MODE.get_or_init(RandomStrength::from_env)
}

fn fill_random(buf: &mut [u8]) {
    match random_strength() {
        RandomStrength::Strong => OsRng.fill_bytes(buf),
        RandomStrength::Default => rand::thread_rng().fill_bytes(buf),
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a UUID v7: 48-bit big-endian unix-millisecond prefix, version
/// nibble `7`, RFC 4122 variant bits, 74 random bits. Millisecond prefixes
/// are non-decreasing across a generated sequence.
pub fn generate_v7() -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[..6].copy_from_slice(&unix_millis().to_be_bytes()[2..8]);
    fill_random(&mut bytes[6..]);
    bytes[6] = (bytes[6] & 0x0f) | 0x70;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Generate a fully random UUID v4.
pub fn generate_v4() -> Uuid {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Deduplication handle for a single logical mutation.
///
/// Two tokens are equal iff both the id and the generation instant are
/// equal. The serialized form is exactly the hyphenated UUID string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyToken {
    id: Uuid,
    generated_at: SystemTime,
}

impl IdempotencyToken {
    /// Generate a fresh time-ordered token.
    pub fn generate() -> Self {
        IdempotencyToken {
            id: generate_v7(),
            generated_at: SystemTime::now(),
        }
    }

    /// Parse a token from its UUID string form.
    pub fn parse(value: &str) -> Result<Self, CounterError> {
        let id = Uuid::parse_str(value).map_err(|e| {
            CounterError::InvalidArgument(format!("token id is not a well-formed UUID: {e}"))
        })?;
        Ok(IdempotencyToken {
            id,
            generated_at: SystemTime::now(),
        })
    }

    /// Rebuild a token from its parts, e.g. when deserializing a request.
    pub fn from_parts(id: Uuid, generated_at: SystemTime) -> Self {
        IdempotencyToken { id, generated_at }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn generated_at(&self) -> SystemTime {
        self.generated_at
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v7_version_and_variant() {
        let uuid = generate_v7();
        assert_eq!(uuid.get_version_num(), 7);
        assert_eq!(uuid.get_variant(), uuid::Variant::RFC4122);
    }

    #[test]
    fn test_v4_version_and_variant() {
        let uuid = generate_v4();
        assert_eq!(uuid.get_version_num(), 4);
        assert_eq!(uuid.get_variant(), uuid::Variant::RFC4122);
    }

    #[test]
    fn test_v7_millisecond_prefix_is_monotone() {
        let prefixes: Vec<u64> = (0..64)
            .map(|_| (generate_v7().as_u128() >> 80) as u64)
            .collect();
        for pair in prefixes.windows(2) {
            assert!(pair[0] <= pair[1], "millisecond prefix went backwards");
        }
    }

    #[test]
    fn test_v7_prefix_tracks_wall_clock() {
        let before = unix_millis();
        let prefix = (generate_v7().as_u128() >> 80) as u64;
        let after = unix_millis();
        assert!(prefix >= before && prefix <= after);
    }

    #[test]
    fn test_token_roundtrip() {
        let token = IdempotencyToken::generate();
        let parsed = IdempotencyToken::parse(&token.to_string()).unwrap();
        assert_eq!(parsed.id(), token.id());
    }

    #[test]
    fn test_token_rejects_malformed_input() {
        assert!(IdempotencyToken::parse("").is_err());
        assert!(IdempotencyToken::parse("not-a-uuid").is_err());
        assert!(IdempotencyToken::parse("0189f1e0-5b2a-7000-8000").is_err());
    }

    #[test]
    fn test_token_equality_includes_generation_time() {
        let token = IdempotencyToken::generate();
        let same = token.clone();
        assert_eq!(token, same);

        let later = IdempotencyToken::from_parts(
            token.id(),
            token.generated_at() + std::time::Duration::from_millis(5),
        );
        assert_ne!(token, later);
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        let a = IdempotencyToken::generate();
        let b = IdempotencyToken::generate();
        assert_ne!(a.id(), b.id());
    }
}
