//! Deadlines and points in time.
//!
//! A [`Timespec`] is a wall-clock instant (seconds and nanoseconds since the
//! Unix epoch) or one of the infinite sentinels. Deadlines handed to
//! [`Channel::create_call`](crate::Channel::create_call) and
//! [`CompletionQueue::poll`](crate::CompletionQueue::poll) are Timespecs.

use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const NANOS_PER_SEC: u32 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Repr {
    InfPast,
    Finite { secs: i64, nanos: u32 },
    InfFuture,
}

/// A point in time with nanosecond resolution, or an infinite sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timespec {
    repr: Repr,
}

impl Timespec {
    /// The Unix epoch.
    pub const fn zero() -> Self {
        Self {
            repr: Repr::Finite { secs: 0, nanos: 0 },
        }
    }

    /// A deadline that never expires.
    pub const fn inf_future() -> Self {
        Self {
            repr: Repr::InfFuture,
        }
    }

    /// A deadline that has always already expired.
    pub const fn inf_past() -> Self {
        Self {
            repr: Repr::InfPast,
        }
    }

    /// Create a Timespec from whole seconds and nanoseconds since the epoch.
    ///
    /// Nanoseconds beyond one second carry into the seconds field.
    pub fn new(secs: i64, nanos: u32) -> Self {
        let carry = (nanos / NANOS_PER_SEC) as i64;
        match secs.checked_add(carry) {
            Some(secs) => Self {
                repr: Repr::Finite {
                    secs,
                    nanos: nanos % NANOS_PER_SEC,
                },
            },
            None => Self::inf_future(),
        }
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        match SystemTime::now().checked_add(timeout) {
            Some(at) => Self::from_system_time(at),
            None => Self::inf_future(),
        }
    }

    /// Convert a [`SystemTime`].
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => match i64::try_from(since.as_secs()) {
                Ok(secs) => Self::new(secs, since.subsec_nanos()),
                Err(_) => Self::inf_future(),
            },
            Err(before) => {
                let before = before.duration();
                let Ok(secs) = i64::try_from(before.as_secs()) else {
                    return Self::inf_past();
                };
                if before.subsec_nanos() == 0 {
                    Self::new(-secs, 0)
                } else {
                    Self::new(-secs - 1, NANOS_PER_SEC - before.subsec_nanos())
                }
            }
        }
    }

    /// Create a Timespec from floating-point seconds since the epoch.
    ///
    /// Infinities map to the sentinels. NaN maps to the infinite past so a
    /// garbage deadline expires instead of hanging forever.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_nan() || secs == f64::NEG_INFINITY {
            return Self::inf_past();
        }
        if secs == f64::INFINITY {
            return Self::inf_future();
        }

        let whole = secs.floor();
        if whole >= i64::MAX as f64 {
            return Self::inf_future();
        }
        if whole < i64::MIN as f64 {
            return Self::inf_past();
        }

        let nanos = ((secs - whole) * NANOS_PER_SEC as f64).round() as u32;
        Self::new(whole as i64, nanos)
    }

    /// Floating-point seconds since the epoch.
    pub fn as_secs_f64(&self) -> f64 {
        match self.repr {
            Repr::InfPast => f64::NEG_INFINITY,
            Repr::InfFuture => f64::INFINITY,
            Repr::Finite { secs, nanos } => secs as f64 + nanos as f64 / NANOS_PER_SEC as f64,
        }
    }

    /// Whole seconds and nanoseconds, or `None` for a sentinel.
    pub fn parts(&self) -> Option<(i64, u32)> {
        match self.repr {
            Repr::Finite { secs, nanos } => Some((secs, nanos)),
            _ => None,
        }
    }

    /// Check if this is the infinite future.
    pub fn is_inf_future(&self) -> bool {
        self.repr == Repr::InfFuture
    }

    /// Check if this is the infinite past.
    pub fn is_inf_past(&self) -> bool {
        self.repr == Repr::InfPast
    }

    /// Time left until this deadline, measured against the wall clock.
    ///
    /// Returns `None` for the infinite future and `Some(Duration::ZERO)` for
    /// deadlines that have already passed.
    pub fn remaining(&self) -> Option<Duration> {
        match self.repr {
            Repr::InfFuture => None,
            Repr::InfPast => Some(Duration::ZERO),
            Repr::Finite { .. } => {
                let now = Self::now();
                if *self <= now {
                    return Some(Duration::ZERO);
                }
                let (secs, nanos) = self.parts()?;
                let (now_secs, now_nanos) = now.parts()?;
                let mut diff_secs = secs - now_secs;
                let diff_nanos = if nanos >= now_nanos {
                    nanos - now_nanos
                } else {
                    diff_secs -= 1;
                    nanos + NANOS_PER_SEC - now_nanos
                };
                Some(Duration::new(diff_secs as u64, diff_nanos))
            }
        }
    }

    /// Map this deadline onto the monotonic clock.
    pub(crate) fn to_instant(self) -> Option<Instant> {
        let remaining = self.remaining()?;
        Instant::now().checked_add(remaining)
    }

    /// Check if this deadline has passed.
    pub fn has_passed(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }
}

impl Default for Timespec {
    fn default() -> Self {
        Self::zero()
    }
}

impl Ord for Timespec {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(repr: &Repr) -> u8 {
            match repr {
                Repr::InfPast => 0,
                Repr::Finite { .. } => 1,
                Repr::InfFuture => 2,
            }
        }

        match (self.repr, other.repr) {
            (Repr::Finite { secs: a, nanos: an }, Repr::Finite { secs: b, nanos: bn }) => {
                (a, an).cmp(&(b, bn))
            }
            (a, b) => rank(&a).cmp(&rank(&b)),
        }
    }
}

impl PartialOrd for Timespec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<f64> for Timespec {
    fn from(secs: f64) -> Self {
        Self::from_secs_f64(secs)
    }
}

impl From<Timespec> for f64 {
    fn from(time: Timespec) -> Self {
        time.as_secs_f64()
    }
}

impl From<SystemTime> for Timespec {
    fn from(time: SystemTime) -> Self {
        Self::from_system_time(time)
    }
}

impl fmt::Debug for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr {
            Repr::InfPast => write!(f, "Timespec(-inf)"),
            Repr::InfFuture => write!(f, "Timespec(+inf)"),
            Repr::Finite { secs, nanos } => write!(f, "Timespec({}.{:09})", secs, nanos),
        }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr {
            Repr::InfPast => write!(f, "-inf"),
            Repr::InfFuture => write!(f, "+inf"),
            Repr::Finite { secs, nanos } => write!(f, "{}.{:09}", secs, nanos),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_roundtrip_now() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        let timespec = Timespec::from(now);
        assert!((now - f64::from(timespec)).abs() < 1e-8);
    }

    #[test]
    fn test_float_roundtrip_samples() {
        for t in [0.0, 1.5, -1.25, 1234567890.123456, 1e-7, -0.000_000_3] {
            let back = Timespec::from_secs_f64(t).as_secs_f64();
            assert!((t - back).abs() < 1e-8, "{} -> {}", t, back);
        }
    }

    #[test]
    fn test_negative_fraction() {
        let t = Timespec::from_secs_f64(-1.25);
        assert_eq!(t.parts(), Some((-2, 750_000_000)));
    }

    #[test]
    fn test_sentinels() {
        assert!(Timespec::inf_future().is_inf_future());
        assert!(Timespec::inf_past().is_inf_past());
        assert_eq!(Timespec::from_secs_f64(f64::INFINITY), Timespec::inf_future());
        assert_eq!(
            Timespec::from_secs_f64(f64::NEG_INFINITY),
            Timespec::inf_past()
        );
        assert_eq!(Timespec::from_secs_f64(f64::NAN), Timespec::inf_past());
        assert_eq!(Timespec::zero().parts(), Some((0, 0)));
    }

    #[test]
    fn test_ordering() {
        let past = Timespec::inf_past();
        let zero = Timespec::zero();
        let later = Timespec::new(10, 5);
        let future = Timespec::inf_future();
        assert!(past < zero);
        assert!(zero < later);
        assert!(later < future);
        assert!(Timespec::new(10, 4) < later);
    }

    #[test]
    fn test_nanos_carry() {
        assert_eq!(Timespec::new(1, 1_500_000_000).parts(), Some((2, 500_000_000)));
    }

    #[test]
    fn test_remaining() {
        assert_eq!(Timespec::inf_future().remaining(), None);
        assert_eq!(Timespec::inf_past().remaining(), Some(Duration::ZERO));
        assert_eq!(Timespec::zero().remaining(), Some(Duration::ZERO));
        assert!(Timespec::zero().has_passed());

        let remaining = Timespec::after(Duration::from_secs(60)).remaining().unwrap();
        assert!(remaining > Duration::from_secs(59));
        assert!(remaining <= Duration::from_secs(60));
    }

    #[test]
    fn test_system_time_before_epoch() {
        let t = UNIX_EPOCH - Duration::from_millis(1500);
        assert_eq!(Timespec::from(t).parts(), Some((-2, 500_000_000)));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Timespec::new(3, 7)), "3.000000007");
        assert_eq!(format!("{}", Timespec::inf_future()), "+inf");
        assert_eq!(format!("{:?}", Timespec::inf_past()), "Timespec(-inf)");
    }
}
