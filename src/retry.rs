//! Bounded exponential backoff with jitter, plus the error classification the
//! pipeline uses to decide between retrying, surfacing, and aborting.

use anyhow::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Manifest/config fetches are retried this many times before the failure is
/// recorded on the image.
pub const FETCH_ATTEMPTS: usize = 5;

/// The delay doubles from here and is deliberately uncapped; registries that
/// need more than a few minutes of patience are not worth hammering.
pub const FETCH_BASE_DELAY: Duration = Duration::from_secs(60);

/// Auth failures are never retried.
pub fn is_auth_error(error: &anyhow::Error) -> bool {
    let message = format!("{error:#}").to_ascii_lowercase();
    message.contains("unauthorized")
        || message.contains("authentication required")
        || message.contains("authentication failure")
}

/// Rate limiting aborts the whole run; retrying only deepens the hole. The
/// status code is matched as a whole token so digests containing "429" do not
/// trip it.
pub fn is_rate_limited(error: &anyhow::Error) -> bool {
    let message = format!("{error:#}").to_ascii_lowercase();
    message.contains("toomanyrequests")
        || message.contains("rate exceeded")
        || message.contains("too many requests")
        || message
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "429")
}

/// An unreachable host during enumeration is an operator error, not a registry
/// quirk, and is treated as fatal.
pub fn is_fatal_connection_error(error: &anyhow::Error) -> bool {
    let message = format!("{error:#}").to_ascii_lowercase();
    message.contains("connection refused")
        || message.contains("no such host")
        || message.contains("dns error")
        || message.contains("failed to lookup address")
        || message.contains("tcp connect error")
        || message.contains("error trying to connect")
}

/// Runs `op` up to `attempts` times, sleeping `delay + jitter` between
/// attempts and doubling the delay each round. Jitter is uniform in
/// `[0, delay/2)`. Auth errors short-circuit immediately.
pub async fn with_backoff<T, F, Fut>(attempts: usize, base_delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = base_delay;
    let mut last_error = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if is_auth_error(&error) {
                    return Err(error);
                }
                log::debug!("attempt {attempt}/{attempts} failed: {error:#}");
                last_error = Some(error);
            }
        }

        if attempt < attempts {
            tokio::time::sleep(delay + jitter(delay)).await;
            delay *= 2;
        }
    }

    Err(last_error.expect("at least one attempt was made"))
}

fn jitter(delay: Duration) -> Duration {
    let half = delay.as_millis() as u64 / 2;
    if half == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..half))
}
