//! Environment abstraction for deterministic testing.
//!
//! Decouples the core from system resources (wall clock, randomness,
//! timers). Production uses [`SystemEnv`]; tests use [`FixedEnv`] with a
//! seeded RNG and a manually advanced clock.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Abstract environment providing time and randomness.
///
/// Implementations must guarantee that `wall_clock_secs` never goes
/// backwards within a process and that `random_bytes` uses
/// cryptographically secure entropy in production.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current wall-clock time as Unix seconds.
    fn wall_clock_secs(&self) -> u64;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u128`, for idempotency tokens and conversation ids.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }

    /// Sleep for `duration`. Only driver code (retry loops) awaits this;
    /// protocol logic stays synchronous.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;
}

/// Production environment using system time and OS cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails: a client without functioning cryptographic
/// randomness cannot generate tokens or nonces safely, and continuing would
/// compromise every sealed value.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn wall_clock_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_secs()
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - cannot operate securely");
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Deterministic environment for tests: seeded RNG, manual clock, no-op
/// sleeps.
#[derive(Clone)]
pub struct FixedEnv {
    now_secs: Arc<AtomicU64>,
    rng_state: Arc<AtomicU64>,
}

impl FixedEnv {
    /// Create with a starting time and RNG seed.
    pub fn new(start_secs: u64, seed: u64) -> Self {
        Self {
            now_secs: Arc::new(AtomicU64::new(start_secs)),
            rng_state: Arc::new(AtomicU64::new(seed | 1)),
        }
    }

    /// Advance the virtual clock.
    pub fn advance_secs(&self, secs: u64) {
        self.now_secs.fetch_add(secs, Ordering::SeqCst);
    }

    fn next_u64(&self) -> u64 {
        // SplitMix64; good enough distribution for deterministic tests.
        let mut state = self.rng_state.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::SeqCst);
        state = (state ^ (state >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        state = (state ^ (state >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        state ^ (state >> 31)
    }
}

impl Default for FixedEnv {
    fn default() -> Self {
        Self::new(1_700_000_000, 0xC0FF_EE00_1234_5678)
    }
}

impl Environment for FixedEnv {
    fn wall_clock_secs(&self) -> u64 {
        self.now_secs.load(Ordering::SeqCst)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(8) {
            let word = self.next_u64().to_be_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        // Virtual time: retry backoff must not slow tests down.
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_env_clock_advances_manually() {
        let env = FixedEnv::new(100, 1);
        assert_eq!(env.wall_clock_secs(), 100);
        env.advance_secs(50);
        assert_eq!(env.wall_clock_secs(), 150);
    }

    #[test]
    fn fixed_env_rng_is_deterministic() {
        let a = FixedEnv::new(0, 99);
        let b = FixedEnv::new(0, 99);
        assert_eq!(a.random_u128(), b.random_u128());
        assert_eq!(a.random_u128(), b.random_u128());
    }

    #[test]
    fn fixed_env_rng_does_not_repeat_immediately() {
        let env = FixedEnv::new(0, 7);
        assert_ne!(env.random_u128(), env.random_u128());
    }

    #[test]
    fn system_env_random_bytes_fills_buffer() {
        let env = SystemEnv::new();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        env.random_bytes(&mut a);
        env.random_bytes(&mut b);
        assert_ne!(a, b, "random bytes should differ");
    }
}
