//! Duration backstop applied after synthesis: pad short clips with trailing
//! silence, trim long ones, leave the rest alone.
//!
//! All arithmetic happens in whole samples at the clip's own rate, so a
//! corrected clip is exactly `round(target * rate)` samples long.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::DubResult;
use crate::model::{PostfitAction, PostfitOutcome};
use crate::wav::{read_pcm16_mono, write_pcm16_mono};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PostfitSummary {
    pub padded_segments: usize,
    pub trimmed_segments: usize,
    pub total_padded_seconds: f64,
    pub total_trimmed_seconds: f64,
}

impl PostfitSummary {
    pub fn record(&mut self, outcome: &PostfitOutcome) {
        match outcome.action {
            PostfitAction::Pad => {
                self.padded_segments += 1;
                self.total_padded_seconds += outcome.adjusted_seconds;
            }
            PostfitAction::Trim => {
                self.trimmed_segments += 1;
                self.total_trimmed_seconds += outcome.adjusted_seconds;
            }
            PostfitAction::None => {}
        }
    }

    #[must_use]
    pub fn modified_segments(&self) -> usize {
        self.padded_segments + self.trimmed_segments
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostfitCorrector {
    enabled: bool,
    trim_tolerance_seconds: f64,
}

impl PostfitCorrector {
    #[must_use]
    pub fn new(enabled: bool, trim_tolerance_seconds: f64) -> Self {
        Self {
            enabled,
            trim_tolerance_seconds: trim_tolerance_seconds.max(0.0),
        }
    }

    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.postfit.enabled, config.qa.max_duration_delta_seconds)
    }

    /// Decide the correction for a clip of `current` samples.
    #[must_use]
    pub fn decide(&self, current: usize, sample_rate: u32, target_duration: f64) -> PostfitAction {
        if !self.enabled || target_duration <= 0.0 || sample_rate == 0 {
            return PostfitAction::None;
        }
        let target_samples = target_sample_count(target_duration, sample_rate);
        let produced = current as f64 / f64::from(sample_rate);
        if current < target_samples {
            PostfitAction::Pad
        } else if produced - target_duration > self.trim_tolerance_seconds
            && current > target_samples
        {
            PostfitAction::Trim
        } else {
            PostfitAction::None
        }
    }

    /// Correct `samples` in place and report what was done.
    pub fn correct_samples(
        &self,
        segment_id: u32,
        samples: &mut Vec<i16>,
        sample_rate: u32,
        target_duration: f64,
    ) -> PostfitOutcome {
        let action = self.decide(samples.len(), sample_rate, target_duration);
        let before = samples.len();
        if action != PostfitAction::None {
            samples.resize(target_sample_count(target_duration, sample_rate), 0);
        }
        let rate = f64::from(sample_rate.max(1));
        PostfitOutcome {
            segment_id,
            action,
            adjusted_seconds: before.abs_diff(samples.len()) as f64 / rate,
            final_duration: samples.len() as f64 / rate,
        }
    }

    /// Apply the correction to the clip on disk, rewriting it only when changed.
    pub fn apply(
        &self,
        segment_id: u32,
        audio_path: &Path,
        target_duration: f64,
    ) -> DubResult<PostfitOutcome> {
        let mut clip = read_pcm16_mono(audio_path)?;
        let outcome =
            self.correct_samples(segment_id, &mut clip.samples, clip.sample_rate, target_duration);
        if outcome.action != PostfitAction::None {
            write_pcm16_mono(audio_path, clip.sample_rate, &clip.samples)?;
            tracing::debug!(
                segment_id,
                action = ?outcome.action,
                adjusted_seconds = outcome.adjusted_seconds,
                "postfit corrected segment"
            );
        }
        Ok(outcome)
    }
}

fn target_sample_count(target_duration: f64, sample_rate: u32) -> usize {
    (target_duration.max(0.0) * f64::from(sample_rate)).round() as usize
}
