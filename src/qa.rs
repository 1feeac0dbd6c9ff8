//! Quality report and strict gate for a synthesis run.
//!
//! The report is derived purely from the output document and the postfit
//! aggregate, so evaluating it twice on the same inputs always yields the same
//! flag list in the same order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::QaConfig;
use crate::error::{DubError, DubResult};
use crate::model::TtsOutputDocument;
use crate::postfit::PostfitSummary;

pub const QA_STAGE: &str = "tts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    DurationOutOfTolerancePresent,
    EmptyTtsTextPresent,
    PostfitSegmentRatioAboveMax,
    PostfitSecondsRatioAboveMax,
}

impl QualityFlag {
    pub const ALL: [Self; 4] = [
        Self::DurationOutOfTolerancePresent,
        Self::EmptyTtsTextPresent,
        Self::PostfitSegmentRatioAboveMax,
        Self::PostfitSecondsRatioAboveMax,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DurationOutOfTolerancePresent => "duration_out_of_tolerance_present",
            Self::EmptyTtsTextPresent => "empty_tts_text_present",
            Self::PostfitSegmentRatioAboveMax => "postfit_segment_ratio_above_max",
            Self::PostfitSecondsRatioAboveMax => "postfit_seconds_ratio_above_max",
        }
    }
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityFlag {
    type Err = DubError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        Self::ALL
            .into_iter()
            .find(|flag| flag.as_str() == normalized)
            .ok_or_else(|| DubError::InvalidConfig(format!("unknown quality flag `{normalized}`")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetrics {
    pub count: usize,
    pub empty_text_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationMetrics {
    pub max_duration_delta_seconds: f64,
    pub mean_abs_delta_seconds: f64,
    pub max_abs_delta_seconds: f64,
    pub out_of_tolerance_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostfitMetrics {
    pub max_segment_ratio: f64,
    pub max_seconds_ratio: f64,
    pub target_total_duration_seconds: f64,
    pub modified_segment_count: usize,
    pub modified_segment_ratio: f64,
    pub total_adjusted_seconds: f64,
    pub adjusted_seconds_ratio: f64,
    pub padding_segments: usize,
    pub trim_segments: usize,
    pub total_padded_seconds: f64,
    pub total_trimmed_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub stage: String,
    pub backend: String,
    pub language: String,
    pub segment_metrics: SegmentMetrics,
    pub duration_metrics: DurationMetrics,
    pub postfit_metrics: PostfitMetrics,
    pub quality_flags: Vec<QualityFlag>,
}

#[must_use]
pub fn build_quality_report(
    doc: &TtsOutputDocument,
    qa: &QaConfig,
    postfit: &PostfitSummary,
) -> QualityReport {
    let absolute_deltas: Vec<f64> = doc
        .segments
        .iter()
        .map(|segment| segment.duration_delta.abs())
        .collect();
    let segment_count = doc.segments.len();
    let empty_text_count = doc
        .segments
        .iter()
        .filter(|segment| segment.target_text.trim().is_empty())
        .count();
    let out_of_tolerance_count = absolute_deltas
        .iter()
        .filter(|delta| **delta > qa.max_duration_delta_seconds)
        .count();
    let mean_abs_delta_seconds = if absolute_deltas.is_empty() {
        0.0
    } else {
        absolute_deltas.iter().sum::<f64>() / absolute_deltas.len() as f64
    };
    let max_abs_delta_seconds = absolute_deltas.iter().copied().fold(0.0_f64, f64::max);

    let target_total_duration_seconds: f64 = doc
        .segments
        .iter()
        .map(|segment| segment.target_duration.max(0.0))
        .sum();
    let modified_segment_count = postfit.padded_segments + postfit.trimmed_segments;
    let modified_segment_ratio = if segment_count > 0 {
        modified_segment_count as f64 / segment_count as f64
    } else {
        0.0
    };
    let total_padded_seconds = postfit.total_padded_seconds.max(0.0);
    let total_trimmed_seconds = postfit.total_trimmed_seconds.max(0.0);
    let total_adjusted_seconds = total_padded_seconds + total_trimmed_seconds;
    let adjusted_seconds_ratio = if target_total_duration_seconds > 0.0 {
        total_adjusted_seconds / target_total_duration_seconds
    } else {
        0.0
    };

    let mut report = QualityReport {
        stage: QA_STAGE.to_owned(),
        backend: doc.backend.clone(),
        language: doc.language.clone(),
        segment_metrics: SegmentMetrics {
            count: segment_count,
            empty_text_count,
        },
        duration_metrics: DurationMetrics {
            max_duration_delta_seconds: qa.max_duration_delta_seconds,
            mean_abs_delta_seconds,
            max_abs_delta_seconds,
            out_of_tolerance_count,
        },
        postfit_metrics: PostfitMetrics {
            max_segment_ratio: qa.max_postfit_segment_ratio,
            max_seconds_ratio: qa.max_postfit_seconds_ratio,
            target_total_duration_seconds,
            modified_segment_count,
            modified_segment_ratio,
            total_adjusted_seconds,
            adjusted_seconds_ratio,
            padding_segments: postfit.padded_segments,
            trim_segments: postfit.trimmed_segments,
            total_padded_seconds,
            total_trimmed_seconds,
        },
        quality_flags: Vec::new(),
    };
    report.quality_flags = raise_flags(&report);
    report
}

/// Flags implied by the metrics already stored in `report`.
///
/// Thresholds are read from the report itself, so re-running this on a
/// persisted report reproduces its flag list.
#[must_use]
pub fn raise_flags(report: &QualityReport) -> Vec<QualityFlag> {
    let mut flags = Vec::new();
    if report.duration_metrics.out_of_tolerance_count > 0 {
        flags.push(QualityFlag::DurationOutOfTolerancePresent);
    }
    if report.segment_metrics.empty_text_count > 0 {
        flags.push(QualityFlag::EmptyTtsTextPresent);
    }
    let postfit = &report.postfit_metrics;
    if postfit.modified_segment_ratio > postfit.max_segment_ratio {
        flags.push(QualityFlag::PostfitSegmentRatioAboveMax);
    }
    if postfit.adjusted_seconds_ratio > postfit.max_seconds_ratio {
        flags.push(QualityFlag::PostfitSecondsRatioAboveMax);
    }
    flags
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub enabled: bool,
    pub passed: bool,
    pub allowed_flags: Vec<QualityFlag>,
    pub blocked_flags: Vec<QualityFlag>,
}

impl GateDecision {
    /// Turn a failed strict gate into `QualityGateFailure`. A disabled gate
    /// never fails, even when flags are blocked.
    pub fn enforce(&self) -> DubResult<()> {
        if self.enabled && !self.passed {
            return Err(DubError::QualityGateFailure {
                blocked_flags: self.blocked_flags.clone(),
            });
        }
        Ok(())
    }
}

#[must_use]
pub fn evaluate_gate(report: &QualityReport, qa: &QaConfig) -> GateDecision {
    let blocked_flags: Vec<QualityFlag> = report
        .quality_flags
        .iter()
        .copied()
        .filter(|flag| !qa.allowed_flags.contains(flag))
        .collect();
    GateDecision {
        enabled: qa.fail_on_flags,
        passed: blocked_flags.is_empty(),
        allowed_flags: qa.allowed_flags.clone(),
        blocked_flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TtsOutputSegment;

    fn output_segment(id: u32, target: f64, produced: f64, text: &str) -> TtsOutputSegment {
        TtsOutputSegment {
            id,
            start: f64::from(id),
            end: f64::from(id) + target,
            target_duration: target,
            synthesized_duration: produced,
            duration_delta: produced - target,
            target_text: text.to_owned(),
            audio_path: format!("segments/seg_{id:06}.wav"),
            postfit_action: crate::model::PostfitAction::None,
        }
    }

    fn output_doc(segments: Vec<TtsOutputSegment>) -> TtsOutputDocument {
        TtsOutputDocument {
            schema_version: "1.0".to_owned(),
            stage: crate::model::TTS_OUTPUT_STAGE.to_owned(),
            generated_at_utc: "2026-01-01T00:00:00+00:00".to_owned(),
            backend: "tone".to_owned(),
            language: "tr".to_owned(),
            sample_rate: 16_000,
            segment_count: segments.len(),
            segments,
        }
    }

    #[test]
    fn clean_run_raises_no_flags() {
        let doc = output_doc(vec![
            output_segment(0, 1.0, 1.0, "merhaba"),
            output_segment(1, 2.0, 2.05, "dunya"),
        ]);
        let report = build_quality_report(&doc, &QaConfig::default(), &PostfitSummary::default());
        assert!(report.quality_flags.is_empty(), "{:?}", report.quality_flags);
        assert_eq!(report.segment_metrics.count, 2);
        assert!((report.duration_metrics.mean_abs_delta_seconds - 0.025).abs() < 1e-9);
        assert!((report.duration_metrics.max_abs_delta_seconds - 0.05).abs() < 1e-9);
        assert!((report.postfit_metrics.target_total_duration_seconds - 3.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_tolerance_and_empty_text_are_flagged() {
        let qa = QaConfig {
            max_duration_delta_seconds: 0.1,
            ..QaConfig::default()
        };
        let doc = output_doc(vec![
            output_segment(0, 1.0, 1.5, "uzun"),
            output_segment(1, 1.0, 1.0, "   "),
        ]);
        let report = build_quality_report(&doc, &qa, &PostfitSummary::default());
        assert_eq!(report.duration_metrics.out_of_tolerance_count, 1);
        assert_eq!(report.segment_metrics.empty_text_count, 1);
        assert_eq!(
            report.quality_flags,
            vec![
                QualityFlag::DurationOutOfTolerancePresent,
                QualityFlag::EmptyTtsTextPresent
            ]
        );
    }

    #[test]
    fn postfit_ratios_raise_flags_above_ceiling() {
        let qa = QaConfig {
            max_postfit_segment_ratio: 0.10,
            max_postfit_seconds_ratio: 0.10,
            ..QaConfig::default()
        };
        let doc = output_doc(vec![
            output_segment(0, 1.0, 1.0, "a"),
            output_segment(1, 1.0, 1.0, "b"),
        ]);
        let postfit = PostfitSummary {
            padded_segments: 2,
            trimmed_segments: 0,
            total_padded_seconds: 1.6,
            total_trimmed_seconds: 0.0,
        };
        let report = build_quality_report(&doc, &qa, &postfit);
        assert!((report.postfit_metrics.modified_segment_ratio - 1.0).abs() < 1e-9);
        assert!((report.postfit_metrics.adjusted_seconds_ratio - 0.8).abs() < 1e-9);
        assert_eq!(
            report.quality_flags,
            vec![
                QualityFlag::PostfitSegmentRatioAboveMax,
                QualityFlag::PostfitSecondsRatioAboveMax
            ]
        );
    }

    #[test]
    fn empty_document_has_zero_ratios() {
        let doc = output_doc(Vec::new());
        let postfit = PostfitSummary::default();
        let report = build_quality_report(&doc, &QaConfig::default(), &postfit);
        assert_eq!(report.postfit_metrics.modified_segment_ratio, 0.0);
        assert_eq!(report.postfit_metrics.adjusted_seconds_ratio, 0.0);
        assert_eq!(report.duration_metrics.mean_abs_delta_seconds, 0.0);
        assert!(report.quality_flags.is_empty());
    }

    #[test]
    fn flag_evaluation_is_idempotent() {
        let qa = QaConfig {
            max_duration_delta_seconds: 0.01,
            max_postfit_segment_ratio: 0.0,
            ..QaConfig::default()
        };
        let doc = output_doc(vec![output_segment(0, 1.0, 1.2, "")]);
        let postfit = PostfitSummary {
            padded_segments: 1,
            ..PostfitSummary::default()
        };
        let report = build_quality_report(&doc, &qa, &postfit);
        assert_eq!(raise_flags(&report), report.quality_flags);
        assert_eq!(raise_flags(&report), raise_flags(&report));

        let persisted = serde_json::to_string(&report).expect("serialize");
        let reloaded: QualityReport = serde_json::from_str(&persisted).expect("deserialize");
        assert_eq!(raise_flags(&reloaded), report.quality_flags);
    }

    #[test]
    fn gate_blocks_only_flags_outside_allow_list() {
        let qa = QaConfig {
            fail_on_flags: true,
            allowed_flags: vec![QualityFlag::DurationOutOfTolerancePresent],
            ..QaConfig::default()
        };
        let mut report =
            build_quality_report(&output_doc(Vec::new()), &qa, &PostfitSummary::default());
        report.quality_flags = vec![
            QualityFlag::DurationOutOfTolerancePresent,
            QualityFlag::PostfitSegmentRatioAboveMax,
        ];
        let gate = evaluate_gate(&report, &qa);
        assert!(gate.enabled);
        assert!(!gate.passed);
        assert_eq!(gate.blocked_flags, vec![QualityFlag::PostfitSegmentRatioAboveMax]);
        let err = gate.enforce().expect_err("strict gate must fail");
        assert!(matches!(err, DubError::QualityGateFailure { .. }));
        assert_eq!(err.exit_code(), 16);
    }

    #[test]
    fn disabled_gate_reports_but_never_fails() {
        let qa = QaConfig::default();
        let mut report =
            build_quality_report(&output_doc(Vec::new()), &qa, &PostfitSummary::default());
        report.quality_flags = vec![QualityFlag::EmptyTtsTextPresent];
        let gate = evaluate_gate(&report, &qa);
        assert!(!gate.enabled);
        assert!(!gate.passed);
        gate.enforce().expect("disabled gate never fails");
    }

    #[test]
    fn flag_names_round_trip_through_from_str() {
        for flag in QualityFlag::ALL {
            assert_eq!(flag.as_str().parse::<QualityFlag>().expect("known"), flag);
            let json = serde_json::to_string(&flag).expect("serialize");
            assert_eq!(json, format!("\"{}\"", flag.as_str()));
        }
        assert!("not_a_flag".parse::<QualityFlag>().is_err());
    }
}
