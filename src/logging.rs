//! Tracing setup for the daemon and the CLI.
//!
//! Human-readable output by default, JSON lines when the daemon runs under a
//! log collector. `RUST_LOG` overrides the computed filter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.log_json,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    fn default_filter(&self) -> String {
        let level = if self.verbose { Level::DEBUG } else { Level::INFO };
        format!("sanitd={}", level.as_str().to_lowercase())
    }
}

/// Install the global subscriber. Call once, after configuration is loaded.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.default_filter()));

    if config.json {
        // Span close events carry each wipe's duration.
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_thread_ids(false))
            .init();
    }
}

/// Lets one message through per interval; the rest are dropped.
///
/// Overwrite passes report every few megabytes, far more often than anyone
/// wants to read.
pub struct LogThrottle {
    interval_ms: u64,
    /// Milliseconds since `start` of the last emitted message.
    last_log_ms: AtomicU64,
    start: Instant,
}

const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        if last != NEVER_LOGGED && now_ms.saturating_sub(last) < self.interval_ms {
            return false;
        }
        // Losing the race means another thread just logged.
        self.last_log_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn reset(&self) {
        self.last_log_ms.store(NEVER_LOGGED, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_lets_first_message_through_then_blocks() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn throttle_reset_allows_log() {
        let throttle = LogThrottle::new(Duration::from_secs(100));
        assert!(throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }

    #[test]
    fn verbose_raises_crate_level() {
        let quiet = LogConfig::default();
        let loud = LogConfig {
            verbose: true,
            ..LogConfig::default()
        };
        assert_eq!(quiet.default_filter(), "sanitd=info");
        assert_eq!(loud.default_filter(), "sanitd=debug");
    }
}
