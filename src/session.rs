//! Session identifiers

use uuid::Uuid;

/// Header carrying the session id in both directions
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Source of fresh session ids
pub trait SessionIdGenerator: Send + Sync {
    /// Produce an id that has not been handed out before
    fn generate(&self) -> String;
}

/// Random UUID v4 session ids
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidSessionIds;

impl SessionIdGenerator for UuidSessionIds {
    fn generate(&self) -> String {
        generate_session_id()
    }
}

impl<F> SessionIdGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn generate(&self) -> String {
        self()
    }
}

/// Generate a new random session id
#[must_use]
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_session_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_generated_ids_are_uuids() {
        let id = UuidSessionIds.generate();
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_closure_generator() {
        let counter = AtomicU32::new(0);
        let generator = move || format!("s-{}", counter.fetch_add(1, Ordering::Relaxed));
        assert_eq!(generator.generate(), "s-0");
        assert_eq!(generator.generate(), "s-1");
    }
}
