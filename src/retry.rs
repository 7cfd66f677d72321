//! Declarative retry policy: how many times, and after what delay, a failed provider
//! attempt should be retried before the failure is surfaced to waiters.
//!
//! Both `RetryPolicy` and `DelayStrategy` are pure value objects — `next()` computes the
//! successor state without any side effects, so a worker loop just replaces its local
//! policy binding on every failed attempt.

use std::time::Duration;

/// How a retry's delay evolves from one attempt to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DelayStrategy {
    Fixed(Duration),
    Exponential { current: Duration, scale: f64 },
    /// Exponential while `remaining_exp` steps remain, then switches to `Fixed(base)` exactly once.
    ExponentialThenFixed { current: Duration, base: Duration, remaining_exp: u32, scale: f64 },
    /// Fixed(base-seeded elsewhere) while `remaining_fixed` steps remain, then switches to
    /// exponential seeded at `initial` exactly once.
    FixedThenExponential { initial: Duration, base: Duration, remaining_fixed: u32, scale: f64 },
}

impl DelayStrategy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed(delay)
    }

    pub fn exponential(initial: Duration, scale: f64) -> Self {
        Self::Exponential { current: initial, scale }
    }

    pub fn exponential_then_fixed(initial: Duration, base: Duration, remaining_exp: u32, scale: f64) -> Self {
        Self::ExponentialThenFixed { current: initial, base, remaining_exp, scale }
    }

    pub fn fixed_then_exponential(initial: Duration, base: Duration, remaining_fixed: u32, scale: f64) -> Self {
        Self::FixedThenExponential { initial, base, remaining_fixed, scale }
    }

    /// The delay to wait before the next attempt.
    pub fn delay(&self) -> Duration {
        match self {
            Self::Fixed(d) => *d,
            Self::Exponential { current, .. } => *current,
            Self::ExponentialThenFixed { current, .. } => *current,
            Self::FixedThenExponential { base, .. } => *base,
        }
    }

    /// Advance to the successor strategy. Pure: does not mutate `self`.
    pub fn next(&self) -> Self {
        match *self {
            Self::Fixed(d) => Self::Fixed(d),
            Self::Exponential { current, scale } => Self::Exponential { current: Self::step(current, scale), scale },
            Self::ExponentialThenFixed { current, base, remaining_exp, scale } => {
                if remaining_exp == 0 {
                    Self::Fixed(base)
                } else {
                    Self::ExponentialThenFixed {
                        current: Self::step(current, scale),
                        base,
                        remaining_exp: remaining_exp - 1,
                        scale,
                    }
                }
            }
            Self::FixedThenExponential { initial, base, remaining_fixed, scale } => {
                if remaining_fixed == 0 {
                    Self::Exponential { current: initial, scale }
                } else {
                    Self::FixedThenExponential { initial, base, remaining_fixed: remaining_fixed - 1, scale }
                }
            }
        }
    }

    fn step(current: Duration, scale: f64) -> Duration {
        let factor = scale.max(1.0);
        let secs = current.as_secs_f64() * factor;
        if secs.is_finite() && secs < Duration::MAX.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            Duration::MAX
        }
    }
}

/// Tagged retry count. `next()` walks the retry/delay state machine to its successor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryPolicy {
    Never,
    Finite(u32, DelayStrategy),
    Infinite(DelayStrategy),
}

impl RetryPolicy {
    pub fn finite(count: u32, strategy: DelayStrategy) -> Self {
        if count == 0 {
            Self::Never
        } else {
            Self::Finite(count, strategy)
        }
    }

    pub fn infinite(strategy: DelayStrategy) -> Self {
        Self::Infinite(strategy)
    }

    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::Never)
    }

    pub fn time_interval(&self) -> Duration {
        match self {
            Self::Never => Duration::ZERO,
            Self::Finite(_, s) => s.delay(),
            Self::Infinite(s) => s.delay(),
        }
    }

    /// Advance after a failed attempt. Pure.
    pub fn next(&self) -> Self {
        match self {
            Self::Never => Self::Never,
            Self::Finite(1, _) => Self::Never,
            Self::Finite(n, s) => Self::Finite(n - 1, s.next()),
            Self::Infinite(s) => Self::Infinite(s.next()),
        }
    }
}

impl From<u32> for RetryPolicy {
    /// Integer-literal construction: `0` means never retry, `n > 0` means retry
    /// `n` times with no delay between attempts.
    fn from(n: u32) -> Self {
        if n == 0 {
            Self::Never
        } else {
            Self::Finite(n, DelayStrategy::Fixed(Duration::ZERO))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Never
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_never_retries() {
        let p = RetryPolicy::Never;
        assert!(!p.should_retry());
        assert!(matches!(p.next(), RetryPolicy::Never));
    }

    #[test]
    fn finite_one_becomes_never() {
        let p = RetryPolicy::finite(1, DelayStrategy::fixed(Duration::from_millis(10)));
        assert!(p.should_retry());
        assert!(matches!(p.next(), RetryPolicy::Never));
    }

    #[test]
    fn finite_n_decrements_and_advances_delay() {
        let p = RetryPolicy::finite(3, DelayStrategy::exponential(Duration::from_millis(10), 2.0));
        let p2 = p.next();
        match p2 {
            RetryPolicy::Finite(2, DelayStrategy::Exponential { current, .. }) => {
                assert_eq!(current, Duration::from_millis(20));
            }
            _ => panic!("expected Finite(2, ...)"),
        }
    }

    #[test]
    fn infinite_never_becomes_never() {
        let p = RetryPolicy::infinite(DelayStrategy::fixed(Duration::from_millis(5)));
        for _ in 0..5 {
            assert!(p.should_retry());
        }
    }

    #[test]
    fn exponential_step_saturates_at_duration_max() {
        let huge = DelayStrategy::exponential(Duration::from_secs(u64::MAX / 2), 10.0);
        let stepped = huge.next();
        assert_eq!(stepped.delay(), Duration::MAX);
    }

    #[test]
    fn exponential_then_fixed_transitions_once() {
        let s = DelayStrategy::exponential_then_fixed(Duration::from_millis(10), Duration::from_millis(100), 1, 2.0);
        let s1 = s.next();
        assert!(matches!(s1, DelayStrategy::ExponentialThenFixed { remaining_exp: 0, .. }));
        let s2 = s1.next();
        assert_eq!(s2, DelayStrategy::Fixed(Duration::from_millis(100)));
        // further calls stay fixed
        assert_eq!(s2.next(), s2);
    }

    #[test]
    fn fixed_then_exponential_transitions_once() {
        let s = DelayStrategy::fixed_then_exponential(Duration::from_millis(50), Duration::from_millis(10), 1, 2.0);
        assert_eq!(s.delay(), Duration::from_millis(10));
        let s1 = s.next();
        assert!(matches!(s1, DelayStrategy::FixedThenExponential { remaining_fixed: 0, .. }));
        let s2 = s1.next();
        match s2 {
            DelayStrategy::Exponential { current, .. } => assert_eq!(current, Duration::from_millis(50)),
            _ => panic!("expected transition to exponential"),
        }
    }

    #[test]
    fn integer_literal_construction() {
        assert!(matches!(RetryPolicy::from(0u32), RetryPolicy::Never));
        match RetryPolicy::from(3u32) {
            RetryPolicy::Finite(3, DelayStrategy::Fixed(d)) => assert_eq!(d, Duration::ZERO),
            _ => panic!("expected Finite(3, Fixed(0))"),
        }
    }
}
