use std::sync::atomic::{AtomicI32, Ordering};

const NONE_SENT: i32 = -1;

/// Lets through only strictly increasing permille values.
///
/// Several progress sources may offer values concurrently; the reporter
/// never accepts the same value twice and never goes backwards.
#[derive(Debug)]
pub struct ProgressReporter {
    last_sent: AtomicI32,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self {
            last_sent: AtomicI32::new(NONE_SENT),
        }
    }

    /// Returns true, and records `permille`, iff it is greater than every
    /// value offered before.
    pub fn offer(&self, permille: u16) -> bool {
        let permille = i32::from(permille);
        self.last_sent.fetch_max(permille, Ordering::AcqRel) < permille
    }

    /// Last accepted value, if any.
    pub fn last_sent(&self) -> Option<u16> {
        u16::try_from(self.last_sent.load(Ordering::Acquire)).ok()
    }

    /// Forgets the last accepted value, for the next job.
    pub fn reset(&self) {
        self.last_sent.store(NONE_SENT, Ordering::Release);
    }
}

/// Converts a fraction in `0.0..=1.0` to permille, clamping out-of-range input.
pub fn fraction_to_permille(fraction: f32) -> u16 {
    if fraction.is_nan() {
        return 0;
    }
    (fraction.clamp(0.0, 1.0) * 1000.0) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_strictly_increasing_values() {
        let reporter = ProgressReporter::new();
        let accepted: Vec<u16> = [100, 50, 100, 300, 300, 301]
            .into_iter()
            .filter(|&p| reporter.offer(p))
            .collect();
        assert_eq!(accepted, vec![100, 300, 301]);
        assert_eq!(reporter.last_sent(), Some(301));
    }

    #[test]
    fn zero_is_accepted_first() {
        let reporter = ProgressReporter::new();
        assert_eq!(reporter.last_sent(), None);
        assert!(reporter.offer(0));
        assert!(!reporter.offer(0));
    }

    #[test]
    fn reset_forgets_last_value() {
        let reporter = ProgressReporter::new();
        assert!(reporter.offer(1000));
        reporter.reset();
        assert!(reporter.offer(10));
    }

    #[test]
    fn concurrent_offers_accept_each_value_once() {
        let reporter = ProgressReporter::new();
        let per_thread: Vec<Vec<u16>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..=1000)
                            .filter(|&p| reporter.offer(p))
                            .collect::<Vec<u16>>()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        for accepted in &per_thread {
            assert!(accepted.windows(2).all(|w| w[0] < w[1]));
        }
        let mut all: Vec<u16> = per_thread.into_iter().flatten().collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "a value was accepted by two threads");
        assert_eq!(all.last(), Some(&1000));
        assert_eq!(reporter.last_sent(), Some(1000));
    }

    #[test]
    fn fractions_are_clamped() {
        assert_eq!(fraction_to_permille(0.5), 500);
        assert_eq!(fraction_to_permille(1.7), 1000);
        assert_eq!(fraction_to_permille(-0.2), 0);
        assert_eq!(fraction_to_permille(f32::NAN), 0);
    }
}
