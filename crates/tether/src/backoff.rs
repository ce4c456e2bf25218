//! Lazy schedules of wait durations, consumed one per retry.

use std::sync::Arc;
use std::time::Duration;

/// A lazy, possibly infinite schedule of wait durations.
///
/// Schedules are iterators: each retry consumes one duration, and a
/// finite schedule that runs out signals exhaustion by returning `None`.
/// A schedule is cloned to restart it from the beginning.
///
/// ```
/// use std::time::Duration;
/// use tether::backoff::Backoff;
///
/// let mut backoff = Backoff::exponential(
///     Duration::from_secs(1),
///     2.0,
///     Duration::from_secs(8),
/// );
/// assert_eq!(backoff.next(), Some(Duration::from_secs(1)));
/// assert_eq!(backoff.next(), Some(Duration::from_secs(2)));
/// assert_eq!(backoff.next(), Some(Duration::from_secs(4)));
/// assert_eq!(backoff.next(), Some(Duration::from_secs(8)));
/// assert_eq!(backoff.next(), Some(Duration::from_secs(8)));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    kind: Kind,
}

#[derive(Debug, Clone)]
enum Kind {
    List { items: Arc<[Duration]>, pos: usize },
    Constant(Duration),
    Exponential { next: Duration, multiplier: f64, cap: Duration },
    Take { inner: Box<Kind>, left: usize },
    Jittered { inner: Box<Kind>, fraction: f64 },
}

impl Backoff {
    /// A finite schedule from an explicit list.
    pub fn from_durations(items: impl Into<Vec<Duration>>) -> Backoff {
        Backoff {
            kind: Kind::List {
                items: items.into().into(),
                pos: 0,
            },
        }
    }

    /// The same wait forever.
    pub fn constant(wait: Duration) -> Backoff {
        Backoff {
            kind: Kind::Constant(wait),
        }
    }

    /// Exponential growth from `initial` by `multiplier`, capped at `cap`,
    /// forever.
    pub fn exponential(initial: Duration, multiplier: f64, cap: Duration) -> Backoff {
        Backoff {
            kind: Kind::Exponential {
                next: initial.min(cap),
                multiplier,
                cap,
            },
        }
    }

    /// At most the first `n` waits of this schedule.
    pub fn limit(self, n: usize) -> Backoff {
        Backoff {
            kind: Kind::Take {
                inner: Box::new(self.kind),
                left: n,
            },
        }
    }

    /// Adds a uniformly distributed increment in `[0, fraction]` of each
    /// nominal wait, truncated to milliseconds, to decorrelate waves of
    /// reconnecting clients.
    pub fn jittered(self, fraction: f64) -> Backoff {
        Backoff {
            kind: Kind::Jittered {
                inner: Box::new(self.kind),
                fraction: fraction.max(0.0),
            },
        }
    }

    /// The default connect schedule: 1s, 2s, 4s, 8s, 16s, then 32s
    /// forever, each wait jittered by up to 10%.
    pub fn default_connect() -> Backoff {
        Backoff::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(32)).jittered(0.1)
    }
}

impl Kind {
    fn advance(&mut self) -> Option<Duration> {
        match self {
            Kind::List { items, pos } => {
                let wait = items.get(*pos).copied();
                if wait.is_some() {
                    *pos += 1;
                }
                wait
            }
            Kind::Constant(wait) => Some(*wait),
            Kind::Exponential {
                next,
                multiplier,
                cap,
            } => {
                let wait = *next;
                *next = next.mul_f64(*multiplier).min(*cap);
                Some(wait)
            }
            Kind::Take { inner, left } => {
                if *left == 0 {
                    return None;
                }
                *left -= 1;
                inner.advance()
            }
            Kind::Jittered { inner, fraction } => {
                use rand::Rng;
                let wait = inner.advance()?;
                let extra = wait.mul_f64(rand::thread_rng().gen_range(0.0..=*fraction));
                Some(Duration::from_millis((wait + extra).as_millis() as u64))
            }
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.kind.advance()
    }
}
