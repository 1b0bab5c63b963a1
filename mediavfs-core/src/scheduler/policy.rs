use std::fmt;

use serde::{Deserialize, Serialize};

use super::load::AggregateLoad;

/// Pacing never recommends more than this many seconds per step.
pub const MAX_WAIT: f64 = 1.0;
/// Waits below this are rounded down to zero.
pub const MIN_WAIT: f64 = 1e-4;
const BACK_OFF_FACTOR: f64 = 1.10;
const BACK_OFF_MIN_STEP: f64 = 0.001;
const SPEED_UP_FACTOR: f64 = 0.95;

/// Named throttling profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Polite,
    #[default]
    Balanced,
    Aggressive,
    /// Never waits.
    Greedy,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction chosen for one pacing step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adjustment {
    BackOff,
    SpeedUp,
    Hold,
}

impl Policy {
    /// Case-insensitive; unknown names map to [`Policy::Balanced`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "polite" => Policy::Polite,
            "aggressive" => Policy::Aggressive,
            "greedy" => Policy::Greedy,
            _ => Policy::Balanced,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Polite => "polite",
            Policy::Balanced => "balanced",
            Policy::Aggressive => "aggressive",
            Policy::Greedy => "greedy",
        }
    }

    /// Wait returned while there is not enough history to judge a trend.
    pub fn seed(&self) -> f64 {
        match self {
            Policy::Polite => 0.05,
            Policy::Balanced => 0.03,
            Policy::Aggressive => 0.005,
            Policy::Greedy => 0.0,
        }
    }

    /// Back-off is tested first; speed-up only applies when it did not fire.
    pub fn verdict(&self, load: &AggregateLoad) -> Adjustment {
        let tracked = load.tracked_pct;
        let max_io = load.max_core_iowait;
        let min_busy = load.min_core_busy;

        let (back_off, speed_up) = match self {
            Policy::Polite => (
                tracked > 30.0 || max_io > 30.0,
                tracked < 20.0 || (max_io < 15.0 && tracked < 30.0),
            ),
            Policy::Aggressive => (
                max_io > 85.0 || (min_busy > 50.0 && tracked > 50.0),
                max_io < 80.0 && min_busy < 10.0,
            ),
            Policy::Balanced => (
                tracked > 80.0 || max_io > 60.0 || (tracked > 50.0 && min_busy > 20.0),
                tracked < 50.0 || max_io < 40.0 || (tracked < 80.0 && min_busy < 20.0),
            ),
            Policy::Greedy => (false, false),
        };

        if back_off {
            Adjustment::BackOff
        } else if speed_up {
            Adjustment::SpeedUp
        } else {
            Adjustment::Hold
        }
    }

    /// Next wait derived from the previously returned one.
    pub fn adjust(&self, previous: f64, load: &AggregateLoad) -> f64 {
        if *self == Policy::Greedy {
            return 0.0;
        }
        let next = match self.verdict(load) {
            Adjustment::BackOff => previous + (previous * (BACK_OFF_FACTOR - 1.0)).max(BACK_OFF_MIN_STEP),
            Adjustment::SpeedUp => previous * SPEED_UP_FACTOR,
            Adjustment::Hold => previous,
        };
        clamp_wait(next)
    }
}

pub fn clamp_wait(wait: f64) -> f64 {
    if !wait.is_finite() || wait < MIN_WAIT {
        0.0
    } else {
        wait.min(MAX_WAIT)
    }
}
