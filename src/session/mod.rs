//! Session lifecycle: identifier generation, the combined session/transport
//! registry, and the request-resolution state machine.

pub mod registry;
pub mod resolve;

use uuid::Uuid;

/// Source of new session identifiers. Production uses [`UuidSource`]; tests
/// substitute a deterministic source to force key collisions.
pub trait SessionIdSource: Send + Sync {
    fn next_id(&self) -> String;
}

/// Cryptographically random v4 UUIDs. Ids are never reused.
pub struct UuidSource;

impl SessionIdSource for UuidSource {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}
