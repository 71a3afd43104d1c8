//! The ingestion pipeline: admission, fetch, processing, and the
//! pending-TX stage feeding it from the chains.

pub mod fetcher;
pub mod message_handler;
pub mod tx_processor;
pub mod worker;

use chrono::Duration;
use rand::Rng;

/// Exponential backoff with jitter for transient failures. The cap keeps
/// long-failing messages retrying every ten minutes until `max_retries`.
pub fn backoff_delay(retries: i32) -> Duration {
    const MAX_DELAY_SECONDS: i64 = 600;
    let exponential = 2_i64.checked_pow(retries.clamp(0, 30) as u32).unwrap_or(i64::MAX);
    let seconds = exponential.min(MAX_DELAY_SECONDS);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    Duration::seconds(seconds) + Duration::milliseconds(jitter_ms)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_then_caps() {
        for retries in 0..20 {
            let expected = 2_i64.pow(retries as u32).min(600);
            let delay = backoff_delay(retries);
            assert!(delay >= Duration::seconds(expected));
            assert!(delay < Duration::seconds(expected + 1));
        }
        // The cap holds even for absurd retry counts.
        assert!(backoff_delay(63) < Duration::seconds(601));
    }
}
