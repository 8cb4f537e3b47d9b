use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use heapless::Vec;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

pub const MAX_ACTIVE_TIMERS: usize = 32;

static_assertions::const_assert!(MAX_ACTIVE_TIMERS > 0 && MAX_ACTIVE_TIMERS <= u8::MAX as usize);

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_scheduled: u32,
    pub total_fired: u32,
    pub total_cancelled: u32,
    pub currently_scheduled: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("timer table is full ({0} active timers)")]
    CapacityExceeded(usize),
    #[error("repeating timers need a positive interval")]
    ZeroInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPhase {
    Armed,
    Cancelled,
    Finished,
}

/// Cancellable handle to a scheduled callback.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    phase: Arc<Mutex<TimerPhase>>,
    abort: AbortHandle,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Prevents any firing that has not started yet.
    ///
    /// A firing is decided under the same lock, so once this returns `true`
    /// the callback will not be invoked again. Returns `false` if the timer
    /// had already fired (one-shot) or was cancelled before.
    pub fn cancel(&self) -> bool {
        {
            let mut phase = self.phase.lock();
            if *phase != TimerPhase::Armed {
                return false;
            }
            *phase = TimerPhase::Cancelled;
        }
        self.abort.abort();
        self.stats.lock().total_cancelled += 1;
        trace!("Timer {} cancelled", self.id);
        true
    }

    pub fn is_active(&self) -> bool {
        *self.phase.lock() == TimerPhase::Armed
    }
}

/// Delayed and repeating callbacks on the tokio runtime.
///
/// Active timers are tracked in a fixed-capacity table so a runaway caller
/// cannot accumulate unbounded tasks; `cancel_all` (also run on drop)
/// releases everything still pending.
#[derive(Debug)]
pub struct TimerScheduler {
    timers: Vec<TimerHandle, MAX_ACTIVE_TIMERS>,
    stats: Arc<Mutex<SchedulerStats>>,
    next_id: u64,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self {
            timers: Vec::new(),
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
            next_id: 0,
        }
    }

    /// Invokes `callback` after `delay`, and every `delay` after that when `repeating`.
    pub fn schedule<F, Fut>(&mut self, repeating: bool, delay: Duration, mut callback: F) -> Result<TimerHandle, SchedulerError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if repeating && delay.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }
        self.prune();
        if self.timers.is_full() {
            return Err(SchedulerError::CapacityExceeded(MAX_ACTIVE_TIMERS));
        }

        self.next_id += 1;
        let id = self.next_id;
        let phase = Arc::new(Mutex::new(TimerPhase::Armed));
        let task_phase = Arc::clone(&phase);
        let task_stats = Arc::clone(&self.stats);

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                {
                    let mut phase = task_phase.lock();
                    if *phase != TimerPhase::Armed {
                        return;
                    }
                    if !repeating {
                        *phase = TimerPhase::Finished;
                    }
                }
                task_stats.lock().total_fired += 1;
                trace!("Timer {} fired", id);
                callback().await;
                if !repeating {
                    return;
                }
            }
        });

        let handle = TimerHandle {
            id,
            phase,
            abort: task.abort_handle(),
            stats: Arc::clone(&self.stats),
        };
        if self.timers.push(handle.clone()).is_err() {
            handle.cancel();
            return Err(SchedulerError::CapacityExceeded(MAX_ACTIVE_TIMERS));
        }
        self.stats.lock().total_scheduled += 1;
        debug!("Scheduled timer {} ({:?}, repeating: {})", id, delay, repeating);
        Ok(handle)
    }

    /// Cancels every pending timer and returns how many were still armed.
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.timers.iter().filter(|timer| timer.cancel()).count();
        self.timers.clear();
        cancelled
    }

    pub fn active_count(&self) -> usize {
        self.timers.iter().filter(|timer| timer.is_active()).count()
    }

    pub fn get_stats(&self) -> SchedulerStats {
        let mut stats = self.stats.lock().clone();
        stats.currently_scheduled = self.active_count() as u8;
        stats
    }

    fn prune(&mut self) {
        self.timers.retain(|timer| timer.is_active());
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
