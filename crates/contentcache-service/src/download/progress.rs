use std::fmt;
use std::sync::Arc;

/// A snapshot of how much of a fetch has been received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub received: u64,
    /// The total size, if the transport knows it.
    pub expected: Option<u64>,
}

impl FetchProgress {
    /// The received fraction in `[0, 1]`, or `None` if the total size is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.expected {
            Some(0) => Some(1.0),
            Some(expected) => Some((self.received as f64 / expected as f64).min(1.0)),
            None => None,
        }
    }
}

/// A callback receiving [`FetchProgress`] notifications.
pub type ProgressFn = Arc<dyn Fn(FetchProgress) + Send + Sync>;

/// The sink a [`Fetcher`](super::Fetcher) reports received bytes to.
///
/// Reporting is cheap and never blocks on the consumers.
#[derive(Clone)]
pub struct Progress {
    sink: Arc<dyn Fn(u64, Option<u64>) + Send + Sync>,
}

impl Progress {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        Self { sink: Arc::new(f) }
    }

    /// A sink that discards everything.
    pub fn noop() -> Self {
        Self::from_fn(|_, _| {})
    }

    /// Reports that `received` bytes out of `expected` have arrived so far.
    pub fn report(&self, received: u64, expected: Option<u64>) {
        (self.sink)(received, expected)
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress").finish_non_exhaustive()
    }
}

/// Throttles the notifications of a single progress subscriber.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProgressThrottle {
    min_interval: f64,
    last_fraction: f64,
}

impl ProgressThrottle {
    pub fn new(min_interval: f64) -> Self {
        Self {
            min_interval,
            last_fraction: 0.0,
        }
    }

    /// The last fraction that was let through.
    pub fn last_fraction(&self) -> f64 {
        self.last_fraction
    }

    /// Whether `progress` should be delivered, recording it if so.
    ///
    /// A complete fetch always passes. Progress of unknown total only passes without a minimum
    /// interval.
    pub fn should_notify(&mut self, progress: &FetchProgress) -> bool {
        match progress.fraction() {
            Some(fraction) if fraction >= 1.0 => {
                self.last_fraction = 1.0;
                true
            }
            Some(fraction) => {
                if fraction - self.last_fraction >= self.min_interval {
                    self.last_fraction = fraction;
                    true
                } else {
                    false
                }
            }
            None => self.min_interval == 0.0,
        }
    }
}
