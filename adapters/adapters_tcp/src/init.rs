//! Initialization Module
//!
//! One-time, process-wide preparation of the socket subsystem. On Unix there
//! is nothing to set up, and `socket2` performs the Windows `WSAStartup` call
//! on its own. The flag still gives every entry point a single place to run
//! first.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the socket subsystem
///
/// Idempotent and thread-safe. Called by [`Handle::create`](crate::Handle::create);
/// callers never need to invoke it themselves, and there is no matching
/// teardown.
pub fn ensure_initialized() {
    INIT.call_once(|| {
        tracing::debug!("socket subsystem initialized");
    });
}

/// Whether [`ensure_initialized`] has completed in this process
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_initialized_is_idempotent() {
        ensure_initialized();
        assert!(is_initialized());
        ensure_initialized();
        assert!(is_initialized());
    }

    #[test]
    fn test_ensure_initialized_from_threads() {
        let workers: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(ensure_initialized))
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(is_initialized());
    }
}
