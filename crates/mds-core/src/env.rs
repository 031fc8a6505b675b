//! Environment abstraction for deterministic testing.
//!
//! Decouples the router's logic from system resources (time, randomness).
//! Enables deterministic simulation (virtual clock, seeded RNG) and
//! production use with real system resources. Unlike the async substrate
//! this crate is descended from, every method here is synchronous: the
//! router is a thread-and-blocking-syscall design (spec §5), not an async
//! one.
use std::time::{Duration, Instant};

/// Abstract environment providing time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion, incorrect simulation setup)
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current time (monotonic).
    ///
    /// # Invariants
    ///
    /// Subsequent calls must return times that never decrease within a
    /// single execution context.
    fn now(&self) -> Instant;

    /// Blocks the calling thread for `duration`.
    ///
    /// Used by the modify-rendezvous wait (spec §5) to implement its bounded
    /// poll; simulation environments may shorten or skip the wait entirely.
    fn sleep(&self, duration: Duration);

    /// Fills `buffer` with random bytes.
    ///
    /// # Invariants
    ///
    /// Given the same RNG seed, this produces the same sequence of bytes;
    /// production implementations use cryptographically secure RNG.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}

/// Production environment backed by real system time and OS entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        // A simple xorshift-based fill would be fine for this substrate's
        // needs (ticket jitter, nothing cryptographic is keyed on it), but
        // we reach for the OS CSPRNG directly to keep the contract honest.
        getrandom(buffer);
    }
}

#[cfg(unix)]
#[allow(clippy::expect_used)]
fn getrandom(buffer: &mut [u8]) {
    use std::fs::File;
    use std::io::Read;

    let mut file = File::open("/dev/urandom")
        .expect("invariant: /dev/urandom must exist on this platform");
    file.read_exact(buffer).expect("invariant: /dev/urandom must never be short");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn system_env_now_is_monotonic() {
        let env = SystemEnv;
        let first = env.now();
        let second = env.now();
        assert!(second >= first);
    }

    #[test]
    fn system_env_fills_full_buffer() {
        let env = SystemEnv;
        let mut buffer = [0u8; 32];
        env.random_bytes(&mut buffer);
        assert!(buffer.iter().any(|&b| b != 0));
    }
}
