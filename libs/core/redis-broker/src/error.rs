//! Redis error classification
//!
//! Decides which Redis failures mean the link is gone, which mean a reply
//! was given up on, and which are replies worth reacting to.
//!
//! An expired server-side block is not an error at all: BLMOVE, BRPOP and
//! XREADGROUP BLOCK answer nil.

use redis::RedisError;

/// The client stopped waiting for a reply. The command may still have run
/// on the server, so whatever it returned is lost.
pub(crate) fn is_response_timeout(err: &RedisError) -> bool {
    err.is_timeout()
}

/// The connection is unusable and has to be replaced.
pub(crate) fn is_connection_loss(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

/// XGROUP CREATE on a group that exists.
pub(crate) fn is_busy_group(err: &RedisError) -> bool {
    err.to_string().contains("BUSYGROUP")
}

/// The consumer group (or its stream) was deleted under us.
pub(crate) fn is_no_group(err: &RedisError) -> bool {
    err.to_string().contains("NOGROUP")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_failures_are_connection_loss() {
        let err = RedisError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        assert!(is_connection_loss(&err));
        assert!(!is_busy_group(&err));
        assert!(!is_no_group(&err));
        assert!(!is_response_timeout(&err));
    }

    #[test]
    fn test_client_timeout_is_a_response_timeout() {
        let err = RedisError::from(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
        assert!(is_response_timeout(&err));
    }
}
