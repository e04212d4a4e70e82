// Coalescing/throttling state machine for a single entity's raw updates
use std::time::Duration;
use tokio::time::Instant;

/// Timing policy applied to raw updates before they are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitPolicy {
    /// Minimum spacing between coalesce-triggered flushes.
    pub min_emit: Duration,
    /// Quiet period before a pending update is flushed.
    pub coalesce: Duration,
    /// Upper bound on how long a pending update may be withheld.
    pub max_delay: Duration,
    pub emit_on_same_value: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NonFinite,
    Duplicate,
}

#[derive(Debug, PartialEq)]
pub enum Tick<T> {
    /// Nothing pending, or no deadline has passed yet.
    NotDue,
    /// The quiet period ended too soon after the last flush and was pushed back.
    Throttled,
    Flush { value: f64, payload: T },
}

#[derive(Debug)]
struct Pending<T> {
    value: f64,
    payload: T,
    coalesce_at: Instant,
    max_delay_at: Instant,
}

/// Two-deadline state machine around one pending cell.
///
/// `Idle` is `pending == None`. Each accepted update replaces the pending
/// value and restarts the coalesce deadline; the max-delay deadline is fixed
/// when the pending cycle begins. The max-delay deadline always flushes, the
/// coalesce deadline is subject to `min_emit`.
#[derive(Debug)]
pub struct Coalescer<T> {
    policy: EmitPolicy,
    pending: Option<Pending<T>>,
    last_committed: Option<f64>,
    last_flush: Option<Instant>,
}

impl<T> Coalescer<T> {
    pub fn new(policy: EmitPolicy) -> Self {
        Self {
            policy,
            pending: None,
            last_committed: None,
            last_flush: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn last_committed(&self) -> Option<f64> {
        self.last_committed
    }

    /// Set the dedup baseline without counting as a flush (history preload).
    pub fn seed(&mut self, value: f64) {
        if value.is_finite() {
            self.last_committed = Some(value);
        }
    }

    pub fn offer(&mut self, value: f64, payload: T, now: Instant) -> Result<(), Rejection> {
        if !value.is_finite() {
            return Err(Rejection::NonFinite);
        }
        if !self.policy.emit_on_same_value
            && self.pending.is_none()
            && self.last_committed == Some(value)
        {
            return Err(Rejection::Duplicate);
        }

        let coalesce_at = now + self.policy.coalesce;
        let max_delay_at = match &self.pending {
            Some(pending) => pending.max_delay_at,
            None => now + self.policy.max_delay,
        };
        self.pending = Some(Pending {
            value,
            payload,
            coalesce_at,
            max_delay_at,
        });
        Ok(())
    }

    /// Earliest instant at which `poll` may do something.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending
            .as_ref()
            .map(|p| p.coalesce_at.min(p.max_delay_at))
    }

    pub fn poll(&mut self, now: Instant) -> Tick<T> {
        let Some(pending) = self.pending.as_mut() else {
            return Tick::NotDue;
        };

        if now < pending.max_delay_at {
            if now < pending.coalesce_at {
                return Tick::NotDue;
            }
            if let Some(last) = self.last_flush {
                let earliest = last + self.policy.min_emit;
                if now < earliest {
                    pending.coalesce_at = earliest;
                    return Tick::Throttled;
                }
            }
        }

        let Some(flushed) = self.pending.take() else {
            return Tick::NotDue;
        };
        self.last_committed = Some(flushed.value);
        self.last_flush = Some(now);
        Tick::Flush {
            value: flushed.value,
            payload: flushed.payload,
        }
    }

    /// Drop any pending update; used on teardown.
    pub fn cancel(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(min_emit: u64, coalesce: u64, max_delay: u64) -> EmitPolicy {
        EmitPolicy {
            min_emit: Duration::from_millis(min_emit),
            coalesce: Duration::from_millis(coalesce),
            max_delay: Duration::from_millis(max_delay),
            emit_on_same_value: false,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_flushes_after_quiet_period() {
        let t0 = Instant::now();
        let mut c = Coalescer::new(policy(0, 30, 1_000));

        c.offer(1.0, "a", t0).unwrap();
        c.offer(2.0, "b", t0 + ms(10)).unwrap();
        assert_eq!(c.deadline(), Some(t0 + ms(40)));
        assert_eq!(c.poll(t0 + ms(39)), Tick::NotDue);
        assert_eq!(
            c.poll(t0 + ms(40)),
            Tick::Flush { value: 2.0, payload: "b" }
        );
        assert!(!c.is_pending());
        assert_eq!(c.deadline(), None);
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut c = Coalescer::new(policy(0, 10, 100));
        let now = Instant::now();
        assert_eq!(c.offer(f64::NAN, (), now), Err(Rejection::NonFinite));
        assert_eq!(c.offer(f64::INFINITY, (), now), Err(Rejection::NonFinite));
        assert!(!c.is_pending());
    }

    #[test]
    fn test_dedups_committed_value_only_when_idle() {
        let t0 = Instant::now();
        let mut c = Coalescer::new(policy(0, 10, 100));
        c.offer(5.0, (), t0).unwrap();
        assert!(matches!(c.poll(t0 + ms(10)), Tick::Flush { .. }));

        assert_eq!(c.offer(5.0, (), t0 + ms(20)), Err(Rejection::Duplicate));

        c.offer(6.0, (), t0 + ms(30)).unwrap();
        // Something is pending, so the committed value is accepted as a replacement.
        assert_eq!(c.offer(5.0, (), t0 + ms(31)), Ok(()));
    }

    #[test]
    fn test_emit_on_same_value() {
        let t0 = Instant::now();
        let mut c = Coalescer::new(EmitPolicy {
            emit_on_same_value: true,
            ..policy(0, 10, 100)
        });
        c.offer(5.0, (), t0).unwrap();
        assert!(matches!(c.poll(t0 + ms(10)), Tick::Flush { .. }));
        assert_eq!(c.offer(5.0, (), t0 + ms(20)), Ok(()));
    }

    #[test]
    fn test_seed_sets_dedup_baseline() {
        let mut c = Coalescer::new(policy(0, 10, 100));
        c.seed(3.0);
        assert_eq!(c.last_committed(), Some(3.0));
        assert_eq!(c.offer(3.0, (), Instant::now()), Err(Rejection::Duplicate));
    }

    #[test]
    fn test_min_emit_defers_coalesce_flush() {
        let t0 = Instant::now();
        let mut c = Coalescer::new(policy(100, 20, 1_000));
        c.offer(1.0, (), t0).unwrap();
        assert!(matches!(c.poll(t0 + ms(20)), Tick::Flush { .. }));

        c.offer(2.0, (), t0 + ms(30)).unwrap();
        assert_eq!(c.poll(t0 + ms(50)), Tick::Throttled);
        assert_eq!(c.deadline(), Some(t0 + ms(120)));
        assert_eq!(c.poll(t0 + ms(119)), Tick::NotDue);
        assert_eq!(c.poll(t0 + ms(120)), Tick::Flush { value: 2.0, payload: () });
    }

    #[test]
    fn test_max_delay_bounds_continuous_updates() {
        let t0 = Instant::now();
        let mut c = Coalescer::new(policy(0, 50, 200));
        let mut flushes = Vec::new();

        // An update every 10ms keeps restarting the quiet period.
        for step in 0..100u64 {
            let now = t0 + ms(step * 10);
            if let Tick::Flush { .. } = c.poll(now) {
                flushes.push(step * 10);
            }
            c.offer(step as f64, (), now).unwrap();
        }

        assert!(flushes.len() >= 4);
        for pair in flushes.windows(2) {
            assert!(pair[1] - pair[0] <= 210, "gap {:?}", pair);
        }
    }

    #[test]
    fn test_max_delay_overrides_min_emit() {
        let t0 = Instant::now();
        let mut c = Coalescer::new(policy(500, 10, 100));
        c.offer(1.0, (), t0).unwrap();
        assert!(matches!(c.poll(t0 + ms(10)), Tick::Flush { .. }));

        c.offer(2.0, (), t0 + ms(20)).unwrap();
        assert_eq!(c.poll(t0 + ms(30)), Tick::Throttled);
        assert_eq!(c.deadline(), Some(t0 + ms(120)));
        assert!(matches!(c.poll(t0 + ms(120)), Tick::Flush { value, .. } if value == 2.0));
    }

    #[test]
    fn test_cancel_clears_pending() {
        let mut c = Coalescer::new(policy(0, 10, 100));
        let now = Instant::now();
        c.offer(1.0, (), now).unwrap();
        c.cancel();
        assert_eq!(c.deadline(), None);
        assert_eq!(c.poll(now + ms(500)), Tick::NotDue);
    }
}
