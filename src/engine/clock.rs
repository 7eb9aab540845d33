//! Clocks used by the orchestration core
//!
//! All waiting in the core (retry backoff, recovery cooldowns) and all
//! timestamps go through a [`Clock`]. Production code uses [`SystemClock`];
//! tests use [`MockClock`], which advances virtual time instead of sleeping
//! and records every requested sleep so backoff schedules can be asserted.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use orbit_orchestrator::engine::{Clock, MockClock};
//!
//! # tokio_test::block_on(async {
//! let clock = MockClock::new();
//! clock.sleep(Duration::from_secs(2)).await;
//! clock.sleep(Duration::from_secs(4)).await;
//! assert_eq!(
//!     clock.sleeps().await,
//!     vec![Duration::from_secs(2), Duration::from_secs(4)]
//! );
//! # });
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Source of time for the orchestration core
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time
    async fn now(&self) -> DateTime<Utc>;

    /// Suspend for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time and real tokio sleeps
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    async fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: sleeping advances virtual time immediately
#[derive(Debug, Clone)]
pub struct MockClock {
    inner: Arc<RwLock<ClockState>>,
}

#[derive(Debug, Clone)]
struct ClockState {
    /// The current virtual time, or None if still following real time
    virtual_time: Option<DateTime<Utc>>,
    /// Every sleep requested through this clock, in order
    sleeps: Vec<Duration>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ClockState {
                virtual_time: None,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Create a clock frozen at `time`
    pub fn starting_at(time: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ClockState {
                virtual_time: Some(time),
                sleeps: Vec::new(),
            })),
        }
    }

    /// Check if the clock is using virtual time
    pub async fn is_virtual(&self) -> bool {
        self.inner.read().await.virtual_time.is_some()
    }

    /// Set the clock to a specific time (enables virtual time)
    pub async fn set(&self, time: DateTime<Utc>) {
        self.inner.write().await.virtual_time = Some(time);
    }

    /// Advance the clock by a duration
    pub async fn forward(&self, duration: Duration) {
        let mut state = self.inner.write().await;
        let current = state.virtual_time.unwrap_or_else(Utc::now);
        state.virtual_time = Some(current + to_chrono(duration));
    }

    /// Advance the clock to a specific time
    /// Returns error if the target time is before the current time
    pub async fn forward_until(&self, target: DateTime<Utc>) -> Result<(), ClockError> {
        let mut state = self.inner.write().await;
        let current = state.virtual_time.unwrap_or_else(Utc::now);

        if target < current {
            return Err(ClockError::CannotGoBackwards { current, target });
        }

        state.virtual_time = Some(target);
        Ok(())
    }

    /// Reset the clock to real time and forget recorded sleeps
    pub async fn reset(&self) {
        let mut state = self.inner.write().await;
        state.virtual_time = None;
        state.sleeps.clear();
    }

    /// Sleeps requested so far, in order
    pub async fn sleeps(&self) -> Vec<Duration> {
        self.inner.read().await.sleeps.clone()
    }

    /// Total virtual time spent sleeping
    pub async fn total_slept(&self) -> Duration {
        self.inner.read().await.sleeps.iter().sum()
    }
}

#[async_trait]
impl Clock for MockClock {
    async fn now(&self) -> DateTime<Utc> {
        let state = self.inner.read().await;
        state.virtual_time.unwrap_or_else(Utc::now)
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.inner.write().await;
        state.sleeps.push(duration);
        let current = state.virtual_time.unwrap_or_else(Utc::now);
        state.virtual_time = Some(current + to_chrono(duration));
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("Cannot move clock backwards: current time is {current}, target is {target}")]
    CannotGoBackwards {
        current: DateTime<Utc>,
        target: DateTime<Utc>,
    },

    #[error("Invalid duration format: {0}")]
    InvalidDurationFormat(String),
}

/// Parse a duration string like "1h30m", "500ms", "2d"
pub fn parse_duration(s: &str) -> Result<Duration, ClockError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ClockError::InvalidDurationFormat(
            "empty string".to_string(),
        ));
    }

    let mut total = Duration::ZERO;
    let mut current_num = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            current_num.push(c);
            continue;
        }

        if current_num.is_empty() {
            return Err(ClockError::InvalidDurationFormat(format!(
                "expected number before unit '{}'",
                c
            )));
        }

        let num: f64 = current_num.parse().map_err(|_| {
            ClockError::InvalidDurationFormat(format!("invalid number: {}", current_num))
        })?;
        current_num.clear();

        let millis = match c {
            'd' => num * 24.0 * 60.0 * 60.0 * 1000.0,
            'h' => num * 60.0 * 60.0 * 1000.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                num
            }
            'm' => num * 60.0 * 1000.0,
            's' => num * 1000.0,
            _ => {
                return Err(ClockError::InvalidDurationFormat(format!(
                    "unknown unit '{}'",
                    c
                )))
            }
        };

        total = total
            .checked_add(Duration::from_millis(millis as u64))
            .ok_or_else(|| out_of_range(s))?;
    }

    // Handle trailing number (assume seconds if no unit)
    if !current_num.is_empty() {
        let num: f64 = current_num.parse().map_err(|_| {
            ClockError::InvalidDurationFormat(format!("invalid number: {}", current_num))
        })?;
        let secs = Duration::try_from_secs_f64(num).map_err(|_| out_of_range(s))?;
        total = total.checked_add(secs).ok_or_else(|| out_of_range(s))?;
    }

    Ok(total)
}

fn out_of_range(s: &str) -> ClockError {
    ClockError::InvalidDurationFormat(format!("duration out of range: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_clock_set() {
        let clock = MockClock::new();
        assert!(!clock.is_virtual().await);

        let target = at("2024-01-15T10:30:00Z");
        clock.set(target).await;

        assert!(clock.is_virtual().await);
        assert_eq!(clock.now().await, target);
    }

    #[tokio::test]
    async fn test_sleep_advances_virtual_time() {
        let clock = MockClock::starting_at(at("2024-01-15T10:00:00Z"));

        clock.sleep(Duration::from_secs(2)).await;
        clock.sleep(Duration::from_secs(4)).await;

        assert_eq!(clock.now().await, at("2024-01-15T10:00:06Z"));
        assert_eq!(
            clock.sleeps().await,
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert_eq!(clock.total_slept().await, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_clock_forward_until() {
        let clock = MockClock::starting_at(at("2024-01-15T10:00:00Z"));

        let target = at("2024-01-15T15:00:00Z");
        clock.forward_until(target).await.unwrap();
        assert_eq!(clock.now().await, target);

        let earlier = at("2024-01-15T09:00:00Z");
        assert!(clock.forward_until(earlier).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_clears_sleeps() {
        let clock = MockClock::starting_at(at("2024-01-15T10:00:00Z"));
        clock.forward(Duration::from_secs(60)).await;
        clock.sleep(Duration::from_millis(10)).await;

        clock.reset().await;
        assert!(!clock.is_virtual().await);
        assert!(clock.sleeps().await.is_empty());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        let err = parse_duration("99999999999999999999999").unwrap_err();
        assert!(matches!(err, ClockError::InvalidDurationFormat(_)));
        assert!(err.to_string().contains("out of range"));
    }
}
