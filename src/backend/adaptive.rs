//! Proportional speed control for synthesizers that only expose a
//! words-per-minute knob.
//!
//! The controller is a small explicit state machine:
//!
//! ```text
//! Synthesizing ──ok──▶ Evaluating ──|delta| ≤ tol──▶ Done(Converged)
//!      ▲  │                 │ ──passes spent──────▶ Done(Exhausted)
//!      │  │tool error       │ ──no new speed──────▶ Done(Stuck)
//!      │  ▼                 ▼
//!      └─ Retrying ◀──── new speed
//! ```
//!
//! Each move into `Retrying` spends one pass, whether it was caused by a new
//! speed proposal or by an external tool failure. Convergence is not
//! guaranteed; the loop is only guaranteed to stop after at most
//! `1 + max_passes` synthesis attempts.

use serde::{Deserialize, Serialize};

use crate::error::DubResult;

/// Step applied when the proportional proposal rounds back to the current speed.
pub const NUDGE_WPM: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveSettings {
    pub enabled: bool,
    pub start_wpm: u32,
    pub min_wpm: u32,
    pub max_wpm: u32,
    pub max_passes: u32,
    pub tolerance_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveExit {
    /// Control was off, the target was non-positive, or the pass budget was 0.
    Disabled,
    Converged,
    /// No clamped speed differs from the current one.
    Stuck,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdaptiveState {
    Synthesizing { speed_wpm: u32 },
    Evaluating { speed_wpm: u32, produced: f64 },
    Retrying { speed_wpm: u32 },
    Done(AdaptiveExit),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveOutcome {
    pub produced_duration: f64,
    pub final_speed_wpm: u32,
    pub attempts: u32,
    pub passes_used: u32,
    pub exit: AdaptiveExit,
    /// Every speed a synthesis was started at, in order.
    pub speeds: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveRateController {
    settings: AdaptiveSettings,
}

impl AdaptiveRateController {
    #[must_use]
    pub fn new(settings: AdaptiveSettings) -> Self {
        Self { settings }
    }

    fn clamp(&self, speed: f64) -> u32 {
        let min = f64::from(self.settings.min_wpm);
        let max = f64::from(self.settings.max_wpm.max(self.settings.min_wpm));
        speed.clamp(min, max) as u32
    }

    #[must_use]
    pub fn start_speed(&self) -> u32 {
        self.clamp(f64::from(self.settings.start_wpm))
    }

    fn is_active(&self, target: f64) -> bool {
        self.settings.enabled && target > 0.0 && self.settings.max_passes > 0
    }

    /// Next speed to try, or `None` when clamping leaves no room to move.
    #[must_use]
    pub fn propose_speed(&self, current: u32, produced: f64, target: f64) -> Option<u32> {
        let delta = produced - target;
        let mut proposed = self.clamp((f64::from(current) * produced / target).round());
        if proposed == current {
            let nudged = if delta > 0.0 {
                current.saturating_add(NUDGE_WPM)
            } else {
                current.saturating_sub(NUDGE_WPM)
            };
            proposed = self.clamp(f64::from(nudged));
        }
        (proposed != current).then_some(proposed)
    }

    /// Drive `synthesize_at` until the produced duration lands within
    /// tolerance of `target` or the loop runs out of moves.
    ///
    /// `synthesize_at` renders at the given speed and returns the produced
    /// duration in seconds.
    pub fn run<F>(&self, target: f64, mut synthesize_at: F) -> DubResult<AdaptiveOutcome>
    where
        F: FnMut(u32) -> DubResult<f64>,
    {
        let active = self.is_active(target);
        let settings = self.settings;
        let mut state = AdaptiveState::Synthesizing {
            speed_wpm: self.start_speed(),
        };
        let mut passes_used = 0_u32;
        let mut speeds = Vec::new();
        let mut last: Option<(u32, f64)> = None;

        loop {
            state = match state {
                AdaptiveState::Synthesizing { speed_wpm } => {
                    speeds.push(speed_wpm);
                    match synthesize_at(speed_wpm) {
                        Ok(produced) => {
                            last = Some((speed_wpm, produced));
                            if active {
                                AdaptiveState::Evaluating {
                                    speed_wpm,
                                    produced,
                                }
                            } else {
                                AdaptiveState::Done(AdaptiveExit::Disabled)
                            }
                        }
                        Err(err)
                            if active
                                && err.is_external_tool_failure()
                                && passes_used < settings.max_passes =>
                        {
                            passes_used += 1;
                            tracing::warn!(
                                speed_wpm,
                                passes_used,
                                error = %err,
                                "synthesis attempt failed; retrying at the same speed"
                            );
                            AdaptiveState::Retrying { speed_wpm }
                        }
                        Err(err) => return Err(err),
                    }
                }
                AdaptiveState::Evaluating {
                    speed_wpm,
                    produced,
                } => {
                    if (produced - target).abs() <= settings.tolerance_seconds {
                        AdaptiveState::Done(AdaptiveExit::Converged)
                    } else if passes_used >= settings.max_passes {
                        AdaptiveState::Done(AdaptiveExit::Exhausted)
                    } else {
                        match self.propose_speed(speed_wpm, produced, target) {
                            Some(next) => {
                                passes_used += 1;
                                AdaptiveState::Retrying { speed_wpm: next }
                            }
                            None => AdaptiveState::Done(AdaptiveExit::Stuck),
                        }
                    }
                }
                AdaptiveState::Retrying { speed_wpm } => {
                    AdaptiveState::Synthesizing { speed_wpm }
                }
                AdaptiveState::Done(exit) => {
                    let (final_speed_wpm, produced_duration) =
                        last.unwrap_or((self.start_speed(), 0.0));
                    tracing::debug!(
                        ?exit,
                        final_speed_wpm,
                        produced_duration,
                        target,
                        attempts = speeds.len(),
                        "adaptive rate control finished"
                    );
                    return Ok(AdaptiveOutcome {
                        produced_duration,
                        final_speed_wpm,
                        attempts: u32::try_from(speeds.len()).unwrap_or(u32::MAX),
                        passes_used,
                        exit,
                        speeds,
                    });
                }
            };
        }
    }
}
