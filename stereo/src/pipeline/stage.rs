use cv_core::{Error, ErrorKind};
use std::fmt;
use std::time::{Duration, Instant};

/// Nodes of the pipeline, in dataflow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Source,
    Rectification,
    Disparity,
    Visualization,
    Reprojection,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Source,
        Stage::Rectification,
        Stage::Disparity,
        Stage::Visualization,
        Stage::Reprojection,
    ];

    /// Visualization always follows the disparity stage and cannot be switched off.
    pub fn is_toggleable(&self) -> bool {
        !matches!(self, Stage::Visualization)
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Source => "source",
            Stage::Rectification => "rectification",
            Stage::Disparity => "disparity",
            Stage::Visualization => "visualization",
            Stage::Reprojection => "reprojection",
        };
        f.write_str(name)
    }
}

/// An error tagged with the stage that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, error: &Error) -> Self {
        Self {
            stage,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.message)
    }
}

impl std::error::Error for StageError {}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StageStatistics {
    pub last_duration: Option<Duration>,
    /// Exponentially smoothed completion rate.
    pub fps: f64,
    pub dropped_frames: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StageClock {
    stats: StageStatistics,
    last_finish: Option<Instant>,
}

impl StageClock {
    pub(crate) fn record(&mut self, duration: Duration, smoothing: f64) -> f64 {
        let now = Instant::now();
        let interval = self
            .last_finish
            .map(|t| now.duration_since(t))
            .unwrap_or(duration)
            .as_secs_f64();
        self.last_finish = Some(now);
        self.stats.last_duration = Some(duration);

        if interval > 0.0 {
            let rate = 1.0 / interval;
            self.stats.fps = if self.stats.fps > 0.0 {
                smoothing * self.stats.fps + (1.0 - smoothing) * rate
            } else {
                rate
            };
        }
        self.stats.fps
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn statistics(&self) -> StageStatistics {
        self.stats
    }
}
