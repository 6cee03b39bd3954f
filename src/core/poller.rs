//! Completion poller
//!
//! Blocks the driver until at least one outstanding operation has finished
//! (or a bounded timeout elapses) and reports which slots are ready.

use crate::core::SlotPool;
use crate::error::Result;
use crate::fs::IoBackend;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Sleep between busy-poll passes when none is configured
pub const DEFAULT_BUSY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default bound on a single poll
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// How the poller waits for completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PollStrategy {
    /// Test every outstanding slot, sleeping `interval` between passes
    BusyPoll {
        /// Sleep between passes
        interval: Duration,
    },
    /// Block on the backend's wait primitive
    #[default]
    EventWait,
}

impl PollStrategy {
    /// Short name for reports
    pub fn name(&self) -> &'static str {
        match self {
            Self::BusyPoll { .. } => "busy-poll",
            Self::EventWait => "event-wait",
        }
    }
}

/// Waits for outstanding operations in a [`SlotPool`]
#[derive(Debug, Clone)]
pub struct CompletionPoller {
    strategy: PollStrategy,
    timeout: Duration,
}

impl Default for CompletionPoller {
    fn default() -> Self {
        Self::new(PollStrategy::default(), DEFAULT_POLL_TIMEOUT)
    }
}

impl CompletionPoller {
    /// Create a poller with the given strategy and per-poll timeout
    pub fn new(strategy: PollStrategy, timeout: Duration) -> Self {
        Self { strategy, timeout }
    }

    /// Configured strategy
    pub fn strategy(&self) -> PollStrategy {
        self.strategy
    }

    /// Per-poll timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The strategy actually used with `pool`'s backend.
    ///
    /// Event waiting degrades to busy polling on backends without a wait
    /// primitive.
    pub fn effective_strategy<B: IoBackend>(&self, pool: &SlotPool<B>) -> PollStrategy {
        match self.strategy {
            PollStrategy::EventWait if !pool.supports_event_wait() => PollStrategy::BusyPoll {
                interval: DEFAULT_BUSY_POLL_INTERVAL,
            },
            strategy => strategy,
        }
    }

    /// Wait for completions and return the ready slot indices, ascending.
    ///
    /// An empty result means the timeout elapsed with nothing finished.
    pub fn poll<B: IoBackend>(&self, pool: &mut SlotPool<B>) -> Result<Vec<usize>> {
        let pending = pool.outstanding();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        match self.effective_strategy(pool) {
            PollStrategy::BusyPoll { interval } => Ok(self.busy_poll(pool, &pending, interval)),
            PollStrategy::EventWait => self.event_wait(pool, &pending),
        }
    }

    fn busy_poll<B: IoBackend>(
        &self,
        pool: &mut SlotPool<B>,
        pending: &[usize],
        interval: Duration,
    ) -> Vec<usize> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let ready = collect_ready(pool, pending);
            if !ready.is_empty() {
                return ready;
            }

            let now = Instant::now();
            if now >= deadline {
                return ready;
            }
            std::thread::sleep(interval.min(deadline - now));
        }
    }

    fn event_wait<B: IoBackend>(
        &self,
        pool: &mut SlotPool<B>,
        pending: &[usize],
    ) -> Result<Vec<usize>> {
        let ready = collect_ready(pool, pending);
        if !ready.is_empty() {
            return Ok(ready);
        }

        pool.wait_any(pending, self.timeout)?;
        Ok(collect_ready(pool, pending))
    }
}

fn collect_ready<B: IoBackend>(pool: &mut SlotPool<B>, pending: &[usize]) -> Vec<usize> {
    pending
        .iter()
        .copied()
        .filter(|&index| pool.poll_slot(index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryBackend;

    fn reading_pool(backend: MemoryBackend, slots: usize) -> SlotPool<MemoryBackend> {
        let mut pool = SlotPool::new(backend, 4, slots).unwrap();
        for i in 0..slots {
            pool.begin_read(i, 3, (i * 4) as u64, 4).unwrap();
        }
        pool
    }

    #[test]
    fn test_poll_without_outstanding_returns_empty() {
        let mut pool = SlotPool::new(MemoryBackend::new(2, 1), 4, 2).unwrap();
        let poller = CompletionPoller::default();
        assert!(poller.poll(&mut pool).unwrap().is_empty());
    }

    #[test]
    fn test_event_wait_reports_each_completion_once() {
        let backend = MemoryBackend::new(4, 9)
            .with_file(3, vec![5; 16])
            .with_max_latency(6);
        let mut pool = reading_pool(backend, 4);
        let poller = CompletionPoller::default();

        let mut seen = Vec::new();
        while !pool.outstanding().is_empty() {
            let ready = poller.poll(&mut pool).unwrap();
            assert!(!ready.is_empty());
            assert!(ready.windows(2).all(|w| w[0] < w[1]));
            for index in ready {
                assert!(!seen.contains(&index));
                assert_eq!(pool.finish(index).unwrap(), 4);
                seen.push(index);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_busy_poll_makes_progress() {
        let backend = MemoryBackend::new(3, 5)
            .with_file(3, vec![1; 12])
            .with_max_latency(3);
        let mut pool = reading_pool(backend, 3);
        let poller = CompletionPoller::new(
            PollStrategy::BusyPoll {
                interval: Duration::ZERO,
            },
            Duration::from_secs(1),
        );

        let mut finished = 0;
        while finished < 3 {
            for index in poller.poll(&mut pool).unwrap() {
                pool.finish(index).unwrap();
                finished += 1;
            }
        }
        assert!(pool.outstanding().is_empty());
    }

    #[test]
    fn test_event_wait_falls_back_without_wait_primitive() {
        let backend = MemoryBackend::new(1, 1).without_event_wait();
        let pool = SlotPool::new(backend, 4, 1).unwrap();
        let poller = CompletionPoller::default();
        assert_eq!(
            poller.effective_strategy(&pool),
            PollStrategy::BusyPoll {
                interval: DEFAULT_BUSY_POLL_INTERVAL
            }
        );
    }

    #[test]
    fn test_busy_poll_times_out_empty() {
        let backend = MemoryBackend::new(1, 1)
            .with_file(3, vec![1; 4])
            .with_min_latency(1_000_000);
        let mut pool = reading_pool(backend, 1);
        let poller = CompletionPoller::new(
            PollStrategy::BusyPoll {
                interval: Duration::from_millis(1),
            },
            Duration::from_millis(5),
        );
        assert!(poller.poll(&mut pool).unwrap().is_empty());
        assert_eq!(pool.outstanding(), vec![0]);
    }
}
