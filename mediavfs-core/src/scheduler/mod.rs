//! Adaptive pacing.
//!
//! The scheduler keeps a short history of load samples and turns it into a
//! recommended delay between units of background work. Each [`Policy`]
//! nudges its previous recommendation up or down depending on how busy the
//! machine and the tracked processes are.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::SchedulerConfig;

mod load;
mod policy;

#[cfg(feature = "system-load")]
pub use load::SystemLoadSource;
pub use load::{
    AggregateLoad, CoreAverages, CpuTimes, LoadReading, LoadSample, LoadSource, LoadThresholds,
    LoadView, parse_proc_stat,
};
pub use policy::{Adjustment, MAX_WAIT, MIN_WAIT, Policy, clamp_wait};

/// Samples kept for trend analysis.
pub const HISTORY_DEPTH: usize = 10;
/// Samples averaged by `next`/`check`.
pub const AVERAGE_WINDOW: usize = 5;

#[derive(Clone, Copy, Debug)]
struct PolicyState {
    wait: f64,
    /// History sequence the wait was computed for.
    seq: u64,
}

#[derive(Default)]
struct SchedulerState {
    previous: Option<LoadReading>,
    history: VecDeque<LoadSample>,
    seq: u64,
    policies: HashMap<Policy, PolicyState>,
}

impl SchedulerState {
    fn window(&self) -> Option<LoadSample> {
        let skip = self.history.len().saturating_sub(AVERAGE_WINDOW);
        LoadSample::mean(self.history.iter().skip(skip))
    }
}

struct SchedulerInner {
    source: Option<Mutex<Box<dyn LoadSource>>>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    last_demand: Mutex<Instant>,
    armed: AtomicBool,
}

/// Load-driven pacing. Clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Scheduler")
            .field("has_source", &self.inner.source.is_some())
            .field("history", &state.history.len())
            .field("seq", &state.seq)
            .field("armed", &self.inner.armed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Scheduler {
    pub fn with_source(source: Box<dyn LoadSource>, config: SchedulerConfig) -> Self {
        Self::build(Some(source), config)
    }

    /// No load source: every policy returns its seed.
    pub fn unavailable() -> Self {
        Self::build(None, SchedulerConfig::manual())
    }

    /// Backed by `/proc/stat` and sysinfo.
    #[cfg(feature = "system-load")]
    pub fn system(config: SchedulerConfig) -> Self {
        let source = SystemLoadSource::new(&config);
        Self::with_source(Box::new(source), config)
    }

    fn build(source: Option<Box<dyn LoadSource>>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                source: source.map(Mutex::new),
                config,
                state: Mutex::new(SchedulerState::default()),
                last_demand: Mutex::new(Instant::now()),
                armed: AtomicBool::new(false),
            }),
        }
    }

    /// Take one reading and append the resulting sample. Returns whether
    /// history grew.
    pub fn sample(&self) -> bool {
        self.inner.sample()
    }

    /// Recommended delay in seconds before the next unit of work.
    pub fn next(&self, policy: Policy) -> f64 {
        self.touch();
        if policy == Policy::Greedy {
            return 0.0;
        }

        let mut state = self.inner.state.lock();
        let seq = state.seq;
        if state.history.len() < 2 {
            let seed = policy.seed();
            state.policies.insert(policy, PolicyState { wait: seed, seq });
            return seed;
        }

        if let Some(cached) = state.policies.get(&policy)
            && cached.seq == seq
        {
            return cached.wait;
        }

        let previous = state
            .policies
            .get(&policy)
            .map_or_else(|| policy.seed(), |p| p.wait);
        let Some(avg) = state.window() else {
            return previous;
        };
        let wait = policy.adjust(previous, &avg.aggregate);
        state.policies.insert(policy, PolicyState { wait, seq });
        debug!(
            %policy,
            wait,
            previous,
            tracked = avg.aggregate.tracked_pct,
            max_io = avg.aggregate.max_core_iowait,
            min_busy = avg.aggregate.min_core_busy,
            "pacing adjusted"
        );
        wait
    }

    /// [`Scheduler::next`] scaled and converted into a sleep duration.
    pub fn pace(&self, policy: Policy, multiplier: f64) -> Duration {
        let seconds = self.next(policy) * multiplier;
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
    }

    /// True when the averaged load exceeds any supplied threshold.
    pub fn check(&self, thresholds: &LoadThresholds) -> bool {
        self.touch();
        let view = self.current_view();
        view.exceeds(thresholds)
    }

    /// Averaged view over the recent window; conservative without history.
    pub fn current_view(&self) -> LoadView {
        let state = self.inner.state.lock();
        state
            .window()
            .map(|avg| LoadView::from_averages(&avg.averages))
            .unwrap_or_else(LoadView::conservative)
    }

    pub fn history(&self) -> Vec<LoadSample> {
        self.inner.state.lock().history.iter().copied().collect()
    }

    pub fn history_len(&self) -> usize {
        self.inner.state.lock().history.len()
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::Acquire)
    }

    /// Record demand and arm the sampling timer when it is idle.
    fn touch(&self) {
        *self.inner.last_demand.lock() = Instant::now();
        let Some(interval) = self.inner.config.sample_interval() else {
            return;
        };
        if self.inner.source.is_none() {
            return;
        }
        if self
            .inner
            .armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                trace!("arming load sampler");
                handle.spawn(run_sampler(Arc::downgrade(&self.inner), interval));
            }
            Err(_) => {
                self.inner.armed.store(false, Ordering::Release);
            }
        }
    }
}

impl SchedulerInner {
    fn sample(&self) -> bool {
        let Some(source) = &self.source else {
            return false;
        };
        let Some(reading) = source.lock().read() else {
            return false;
        };

        let mut state = self.state.lock();
        let sample = state
            .previous
            .as_ref()
            .and_then(|prev| LoadSample::between(prev, &reading));
        state.previous = Some(reading);
        let Some(sample) = sample else {
            return false;
        };

        state.history.push_back(sample);
        while state.history.len() > HISTORY_DEPTH {
            state.history.pop_front();
        }
        state.seq += 1;
        trace!(
            seq = state.seq,
            tracked = sample.aggregate.tracked_pct,
            max_io = sample.aggregate.max_core_iowait,
            "load sampled"
        );
        true
    }

    fn idle_for(&self) -> Duration {
        self.last_demand.lock().elapsed()
    }
}

async fn run_sampler(inner: Weak<SchedulerInner>, interval: Duration) {
    loop {
        {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.idle_for() >= inner.config.idle_disarm() {
                inner.armed.store(false, Ordering::Release);
                // Demand may have arrived between the check and the store.
                if inner.idle_for() >= inner.config.idle_disarm()
                    || inner
                        .armed
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                {
                    trace!("load sampler disarmed");
                    return;
                }
            }
            inner.sample();
        }
        tokio::time::sleep(interval).await;
    }
}
