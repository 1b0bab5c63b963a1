use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Cumulative per-core CPU counters (jiffies since boot).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }
}

/// One raw reading from a [`LoadSource`].
#[derive(Clone, Debug)]
pub struct LoadReading {
    pub at: Instant,
    pub cores: Vec<CpuTimes>,
    /// Cumulative CPU time of the tracked process group.
    pub tracked_cpu: Option<Duration>,
}

/// Pluggable source of load readings. `None` means the source is unavailable
/// for this tick; the scheduler then keeps its previous history.
pub trait LoadSource: Send {
    fn read(&mut self) -> Option<LoadReading>;
}

/// Cross-core summary of one sampling interval, in percent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateLoad {
    pub min_core_busy: f64,
    pub min_core_busy_non_nice: f64,
    pub max_core_iowait: f64,
    /// CPU used by the tracked processes; one saturated core is 100.
    pub tracked_pct: f64,
}

/// Per-core average of one sampling interval, in percent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreAverages {
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub aggregate: AggregateLoad,
    pub averages: CoreAverages,
}

fn pct(delta: u64, total: u64) -> f64 {
    delta as f64 * 100.0 / total as f64
}

impl LoadSample {
    /// Percentages accumulated between two readings. `None` when no core
    /// advanced (identical readings or a source restart).
    pub fn between(prev: &LoadReading, next: &LoadReading) -> Option<Self> {
        let mut aggregate = AggregateLoad {
            min_core_busy: f64::MAX,
            min_core_busy_non_nice: f64::MAX,
            max_core_iowait: 0.0,
            tracked_pct: 0.0,
        };
        let mut sums = CoreAverages::default();
        let mut counted = 0usize;

        for (before, after) in prev.cores.iter().zip(next.cores.iter()) {
            let total = after.total().saturating_sub(before.total());
            if total == 0 {
                continue;
            }
            let d = |a: u64, b: u64| pct(a.saturating_sub(b), total);
            let user = d(after.user, before.user);
            let nice = d(after.nice, before.nice);
            let system = d(after.system, before.system);
            let idle = d(after.idle, before.idle);
            let iowait = d(after.iowait, before.iowait);
            let irq = d(after.irq, before.irq);
            let softirq = d(after.softirq, before.softirq);

            let busy = 100.0 - idle - iowait;
            let busy_non_nice = busy - nice;
            aggregate.min_core_busy = aggregate.min_core_busy.min(busy);
            aggregate.min_core_busy_non_nice = aggregate.min_core_busy_non_nice.min(busy_non_nice);
            aggregate.max_core_iowait = aggregate.max_core_iowait.max(iowait);

            sums.user += user;
            sums.nice += nice;
            sums.system += system;
            sums.idle += idle;
            sums.iowait += iowait;
            sums.irq += irq;
            sums.softirq += softirq;
            counted += 1;
        }

        if counted == 0 {
            return None;
        }

        let wall = next.at.saturating_duration_since(prev.at).as_secs_f64();
        if let (Some(before), Some(after)) = (prev.tracked_cpu, next.tracked_cpu)
            && wall > 0.0
        {
            aggregate.tracked_pct = after.saturating_sub(before).as_secs_f64() / wall * 100.0;
        }

        let n = counted as f64;
        let averages = CoreAverages {
            user: sums.user / n,
            nice: sums.nice / n,
            system: sums.system / n,
            idle: sums.idle / n,
            iowait: sums.iowait / n,
            irq: sums.irq / n,
            softirq: sums.softirq / n,
        };

        Some(Self {
            aggregate,
            averages,
        })
    }

    /// Field-wise mean.
    pub fn mean<'a>(samples: impl IntoIterator<Item = &'a LoadSample>) -> Option<Self> {
        let mut acc = LoadSample::default();
        let mut n = 0usize;
        for s in samples {
            acc.aggregate.min_core_busy += s.aggregate.min_core_busy;
            acc.aggregate.min_core_busy_non_nice += s.aggregate.min_core_busy_non_nice;
            acc.aggregate.max_core_iowait += s.aggregate.max_core_iowait;
            acc.aggregate.tracked_pct += s.aggregate.tracked_pct;
            acc.averages.user += s.averages.user;
            acc.averages.nice += s.averages.nice;
            acc.averages.system += s.averages.system;
            acc.averages.idle += s.averages.idle;
            acc.averages.iowait += s.averages.iowait;
            acc.averages.irq += s.averages.irq;
            acc.averages.softirq += s.averages.softirq;
            n += 1;
        }
        if n == 0 {
            return None;
        }
        let n = n as f64;
        let a = &mut acc.aggregate;
        a.min_core_busy /= n;
        a.min_core_busy_non_nice /= n;
        a.max_core_iowait /= n;
        a.tracked_pct /= n;
        let c = &mut acc.averages;
        c.user /= n;
        c.nice /= n;
        c.system /= n;
        c.idle /= n;
        c.iowait /= n;
        c.irq /= n;
        c.softirq /= n;
        Some(acc)
    }
}

/// Upper (or, for `idle`, lower) bounds for [`Scheduler::check`](super::Scheduler::check).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadThresholds {
    pub user: Option<f64>,
    pub nice: Option<f64>,
    pub sys: Option<f64>,
    /// `100 - idle`.
    pub all: Option<f64>,
    /// `all - nice`.
    pub nonnice: Option<f64>,
    /// Trips when idle drops *below* this value.
    pub idle: Option<f64>,
    pub io: Option<f64>,
}

/// Averaged view compared against [`LoadThresholds`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadView {
    pub user: f64,
    pub nice: f64,
    pub sys: f64,
    pub all: f64,
    pub nonnice: f64,
    pub idle: f64,
    pub io: f64,
}

impl LoadView {
    /// Assumed when nothing has been sampled yet.
    pub fn conservative() -> Self {
        Self {
            user: 50.0,
            nice: 50.0,
            sys: 50.0,
            all: 50.0,
            nonnice: 50.0,
            idle: 50.0,
            io: 50.0,
        }
    }

    pub fn from_averages(avg: &CoreAverages) -> Self {
        let all = 100.0 - avg.idle;
        Self {
            user: avg.user,
            nice: avg.nice,
            sys: avg.system,
            all,
            nonnice: all - avg.nice,
            idle: avg.idle,
            io: avg.iowait,
        }
    }

    pub fn exceeds(&self, limits: &LoadThresholds) -> bool {
        let over = |value: f64, limit: Option<f64>| limit.is_some_and(|limit| value > limit);
        over(self.user, limits.user)
            || over(self.nice, limits.nice)
            || over(self.sys, limits.sys)
            || over(self.all, limits.all)
            || over(self.nonnice, limits.nonnice)
            || over(self.io, limits.io)
            || limits.idle.is_some_and(|limit| self.idle < limit)
    }
}

/// Parse the `cpuN` lines of `/proc/stat`. The aggregate `cpu` line is skipped.
pub fn parse_proc_stat(text: &str) -> Vec<CpuTimes> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let label = fields.next()?;
            let index = label.strip_prefix("cpu")?;
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let mut values = fields.map(|v| v.parse::<u64>().unwrap_or(0));
            let mut next = || values.next().unwrap_or(0);
            Some(CpuTimes {
                user: next(),
                nice: next(),
                system: next(),
                idle: next(),
                iowait: next(),
                irq: next(),
                softirq: next(),
                steal: next(),
            })
        })
        .collect()
}

#[cfg(feature = "system-load")]
pub use system::SystemLoadSource;

#[cfg(feature = "system-load")]
mod system {
    use std::fmt;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
    use tracing::{debug, warn};

    use super::{LoadReading, LoadSource, parse_proc_stat};
    use crate::config::SchedulerConfig;

    /// `/proc/stat` per-core counters plus sysinfo CPU time of a process
    /// group discovered by name.
    pub struct SystemLoadSource {
        stat_path: PathBuf,
        system: System,
        names: Vec<String>,
        track_self: bool,
        pids: Vec<Pid>,
        discovered_at: Option<Instant>,
        refresh_every: Duration,
        stat_failed: bool,
    }

    impl fmt::Debug for SystemLoadSource {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("SystemLoadSource")
                .field("stat_path", &self.stat_path)
                .field("names", &self.names)
                .field("tracked_pids", &self.pids.len())
                .finish()
        }
    }

    impl SystemLoadSource {
        pub fn new(config: &SchedulerConfig) -> Self {
            Self {
                stat_path: PathBuf::from("/proc/stat"),
                system: System::new_with_specifics(RefreshKind::nothing()),
                names: config.tracked_processes.clone(),
                track_self: config.track_self,
                pids: Vec::new(),
                discovered_at: None,
                refresh_every: config.process_refresh(),
                stat_failed: false,
            }
        }

        fn discover(&mut self) {
            self.system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing().with_cpu(),
            );
            let mut pids: Vec<Pid> = self
                .system
                .processes()
                .iter()
                .filter(|(_, process)| {
                    let name = process.name().to_string_lossy();
                    self.names.iter().any(|wanted| wanted.as_str() == name.as_ref())
                })
                .map(|(pid, _)| *pid)
                .collect();
            if self.track_self
                && let Ok(own) = sysinfo::get_current_pid()
                && !pids.contains(&own)
            {
                pids.push(own);
            }
            debug!(tracked = pids.len(), "rediscovered tracked processes");
            self.pids = pids;
            self.discovered_at = Some(Instant::now());
        }

        fn tracked_cpu(&mut self) -> Option<Duration> {
            let due = self
                .discovered_at
                .is_none_or(|at| at.elapsed() >= self.refresh_every);
            if due {
                self.discover();
            } else if !self.pids.is_empty() {
                self.system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&self.pids),
                    true,
                    ProcessRefreshKind::nothing().with_cpu(),
                );
            }

            // Processes that exited are dropped without notice.
            let system = &self.system;
            self.pids.retain(|pid| system.process(*pid).is_some());
            if self.pids.is_empty() {
                return None;
            }
            let millis: u64 = self
                .pids
                .iter()
                .filter_map(|pid| system.process(*pid))
                .map(|process| process.accumulated_cpu_time())
                .sum();
            Some(Duration::from_millis(millis))
        }
    }

    impl LoadSource for SystemLoadSource {
        fn read(&mut self) -> Option<LoadReading> {
            let text = match std::fs::read_to_string(&self.stat_path) {
                Ok(text) => text,
                Err(err) => {
                    if !self.stat_failed {
                        warn!(path = %self.stat_path.display(), error = %err, "load source unavailable; pacing falls back to seeds");
                        self.stat_failed = true;
                    }
                    return None;
                }
            };
            let cores = parse_proc_stat(&text);
            if cores.is_empty() {
                return None;
            }
            Some(LoadReading {
                at: Instant::now(),
                cores,
                tracked_cpu: self.tracked_cpu(),
            })
        }
    }
}
