//! Test utilities for codefetch.

use rand::{Rng, SeedableRng};

/// Enable tracing with the RUST_LOG environment variable.
///
/// This is intended to be used in tests, so it defaults to DEBUG level.
pub fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .try_init();
}

/// `len` random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    rand::thread_rng().fill(&mut out[..]);
    out
}

/// `len` bytes derived from `seed`, the same on every run.
pub fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    rand::rngs::StdRng::seed_from_u64(seed).fill(&mut out[..]);
    out
}

/// Run `code` in a loop until it `break`s, sleeping between iterations.
///
/// Panics once `timeout_ms` (default 1000) have passed. Under a paused
/// tokio clock the sleeps auto-advance, so long protocol timeouts are
/// cheap to wait out.
#[macro_export]
macro_rules! iter_check {
    ($timeout_ms:literal, $sleep_ms:literal, $code:block) => {
        ::tokio::time::timeout(
            ::std::time::Duration::from_millis($timeout_ms),
            async {
                loop {
                    ::tokio::time::sleep(::std::time::Duration::from_millis(
                        $sleep_ms,
                    ))
                    .await;
                    $code
                }
            },
        )
        .await
        .unwrap();
    };
    ($timeout_ms:literal, $code:block) => {
        $crate::iter_check!($timeout_ms, 10, $code)
    };
    ($code:block) => {
        $crate::iter_check!(1000, $code)
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seeded_bytes_are_stable() {
        assert_eq!(seeded_bytes(3, 16), seeded_bytes(3, 16));
        assert_ne!(seeded_bytes(3, 16), seeded_bytes(4, 16));
        assert_eq!(100, random_bytes(100).len());
    }
}
