//! Test fixtures for the broker crates.
//!
//! - [`TestRedis`] (feature `redis`, on by default): a Redis container per
//!   test, with inspection helpers for lists, streams and consumer groups.
//! - [`TestKeys`]: stable, per-test key names for tests that share state.
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, default-features = false, features = ["redis"] }
//! ```

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Derives key names from a test's name.
///
/// The same test always gets the same names, and two tests never collide
/// unless their names hash alike.
///
/// ```
/// use test_utils::TestKeys;
///
/// let keys = TestKeys::for_test("test_stream_replay");
/// let topic = keys.key("topic", "events");
/// assert!(topic.starts_with("test:topic:"));
/// assert_eq!(topic, TestKeys::for_test("test_stream_replay").key("topic", "events"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestKeys {
    tag: u64,
}

impl TestKeys {
    pub fn for_test(test_name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        test_name.hash(&mut hasher);
        Self {
            tag: hasher.finish(),
        }
    }

    /// `test:<kind>:<tag>:<name>`
    pub fn key(&self, kind: &str, name: &str) -> String {
        format!("test:{kind}:{:016x}:{name}", self.tag)
    }
}
