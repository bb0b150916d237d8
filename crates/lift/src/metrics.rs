use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

static METRICS_LOCK_POISON_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_metrics_lock_poison_once(operation: &'static str) {
    if METRICS_LOCK_POISON_WARNED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warn!(operation, "metrics lock poisoned; recovered inner value");
    }
}

/// Counters are cumulative for the process; gauges describe the latest tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferMetricsSnapshot {
    pub batches_dispatched: u64,
    pub batches_abandoned: u64,
    pub invites_sent: u64,
    pub commits: u64,
    pub expirations: u64,
    pub disconnects_in_flight: u64,
    pub handoff_failures: u64,
    pub ready_rejections: u64,
    pub zone_members: usize,
    pub pending_transfers: usize,
    pub live_instances: usize,
    pub pending_destroys: usize,
}

#[derive(Clone, Debug)]
pub struct TransferMetricsHandle {
    snapshot: Arc<RwLock<TransferMetricsSnapshot>>,
}

impl Default for TransferMetricsHandle {
    fn default() -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(TransferMetricsSnapshot::default())),
        }
    }
}

impl TransferMetricsHandle {
    pub fn snapshot(&self) -> TransferMetricsSnapshot {
        match self.snapshot.read() {
            Ok(guard) => *guard,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("read");
                *poisoned.into_inner()
            }
        }
    }

    pub(crate) fn publish(&self, snapshot: TransferMetricsSnapshot) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("write");
                let mut guard = poisoned.into_inner();
                *guard = snapshot;
            }
        }
    }
}

/// Rate-limits the periodic metrics log line.
#[derive(Debug)]
pub struct MetricsLogGate {
    interval_start: Instant,
    interval: Duration,
    ticks: u32,
}

impl MetricsLogGate {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval_start: now,
            interval,
            ticks: 0,
        }
    }

    pub fn record_tick(&mut self) {
        self.ticks = self.ticks.saturating_add(1);
    }

    /// Returns the measured ticks per second once per interval.
    pub fn maybe_emit(&mut self, now: Instant) -> Option<f32> {
        let elapsed = now.saturating_duration_since(self.interval_start);
        if elapsed < self.interval {
            return None;
        }
        let tps = self.ticks as f32 / elapsed.as_secs_f32().max(f32::EPSILON);
        self.interval_start = now;
        self.ticks = 0;
        Some(tps)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;
    use std::thread;

    use super::*;

    fn poison_lock(lock: &RwLock<TransferMetricsSnapshot>) {
        thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = lock.write().expect("write guard");
                    panic!("poison metrics lock");
                })
                .join();
        });
    }

    #[test]
    fn gate_emits_once_per_interval() {
        let base = Instant::now();
        let mut gate = MetricsLogGate::new(Duration::from_secs(1), base);
        for _ in 0..4 {
            gate.record_tick();
        }
        assert!(gate.maybe_emit(base + Duration::from_millis(500)).is_none());
        let tps = gate
            .maybe_emit(base + Duration::from_secs(1))
            .expect("emitted");
        assert!((tps - 4.0).abs() < 0.05);
        assert!(gate.maybe_emit(base + Duration::from_millis(1500)).is_none());
    }

    #[test]
    fn snapshot_recovers_after_poison_without_panic() {
        let handle = TransferMetricsHandle::default();
        poison_lock(handle.snapshot.as_ref());

        assert_eq!(handle.snapshot(), TransferMetricsSnapshot::default());
    }

    #[test]
    fn publish_recovers_after_poison_without_panic() {
        let handle = TransferMetricsHandle::default();
        poison_lock(handle.snapshot.as_ref());

        let expected = TransferMetricsSnapshot {
            commits: 3,
            pending_transfers: 1,
            ..TransferMetricsSnapshot::default()
        };
        handle.publish(expected);
        assert_eq!(handle.snapshot(), expected);
    }
}
