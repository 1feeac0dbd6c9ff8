//! Promote the recommended benchmark profile to a locked config path.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::benchmark::{BenchmarkProfileResult, BenchmarkReport, ProfileStatus};
use crate::error::{DubError, DubResult};
use crate::model::write_json;
use crate::qa::QualityFlag;

pub const SELECTION_STAGE: &str = "tts_profile_selection";
pub const SELECTION_REPORT_FILE: &str = "profile_selection.json";

/// The benchmark numbers that justified the pick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionMetrics {
    pub status: ProfileStatus,
    pub total_pipeline_seconds: Option<f64>,
    pub max_abs_duration_delta_seconds: Option<f64>,
    pub quality_flag_count: Option<usize>,
    pub quality_flags: Vec<QualityFlag>,
    pub postfit_padding_segments: Option<usize>,
    pub postfit_trim_segments: Option<usize>,
    pub postfit_total_padded_seconds: Option<f64>,
    pub postfit_total_trimmed_seconds: Option<f64>,
}

impl From<&BenchmarkProfileResult> for SelectionMetrics {
    fn from(profile: &BenchmarkProfileResult) -> Self {
        Self {
            status: profile.status,
            total_pipeline_seconds: profile.total_pipeline_seconds,
            max_abs_duration_delta_seconds: profile.max_abs_duration_delta_seconds,
            quality_flag_count: profile.quality_flag_count,
            quality_flags: profile.quality_flags.clone(),
            postfit_padding_segments: profile.postfit_padding_segments,
            postfit_trim_segments: profile.postfit_trim_segments,
            postfit_total_padded_seconds: profile.postfit_total_padded_seconds,
            postfit_total_trimmed_seconds: profile.postfit_total_trimmed_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionReport {
    pub stage: String,
    pub generated_at_utc: String,
    pub benchmark_report_json: String,
    pub recommended_profile: String,
    pub source_config_path: String,
    pub output_config_path: String,
    pub selection_metrics: SelectionMetrics,
}

#[derive(Debug, Clone)]
pub struct SelectionArtifacts {
    pub recommended_profile: String,
    pub source_config_path: PathBuf,
    pub output_config_path: PathBuf,
    pub selection_report_json: PathBuf,
    pub report: SelectionReport,
}

/// Copy the recommended profile's config to `output_config_path` and write the
/// selection report. The report defaults to `profile_selection.json` next to
/// the benchmark report.
pub fn lock_recommended_profile(
    benchmark_report_json: &Path,
    output_config_path: &Path,
    selection_report_json: Option<&Path>,
) -> DubResult<SelectionArtifacts> {
    if !benchmark_report_json.is_file() {
        return Err(DubError::InputNotFound(benchmark_report_json.to_path_buf()));
    }
    let benchmark = BenchmarkReport::load(benchmark_report_json)?;
    let recommended = benchmark.summary.recommended_profile.as_deref().ok_or_else(|| {
        DubError::InvalidContract(format!(
            "no recommended profile in {}",
            benchmark_report_json.display()
        ))
    })?;
    let selected = benchmark.recommended().ok_or_else(|| {
        DubError::InvalidContract(format!(
            "recommended profile `{recommended}` not found in profile list"
        ))
    })?;

    let source_config_path = PathBuf::from(&selected.config_path);
    if !source_config_path.is_file() {
        return Err(DubError::InputNotFound(source_config_path));
    }
    if let Some(parent) = output_config_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&source_config_path, output_config_path)?;

    let selection_report_json = selection_report_json.map_or_else(
        || {
            benchmark_report_json
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(SELECTION_REPORT_FILE)
        },
        Path::to_path_buf,
    );
    let report = SelectionReport {
        stage: SELECTION_STAGE.to_owned(),
        generated_at_utc: Utc::now().to_rfc3339(),
        benchmark_report_json: benchmark_report_json.display().to_string(),
        recommended_profile: recommended.to_owned(),
        source_config_path: source_config_path.display().to_string(),
        output_config_path: output_config_path.display().to_string(),
        selection_metrics: SelectionMetrics::from(selected),
    };
    write_json(&selection_report_json, &report)?;
    tracing::info!(
        profile = recommended,
        locked = %output_config_path.display(),
        "locked recommended profile"
    );

    Ok(SelectionArtifacts {
        recommended_profile: recommended.to_owned(),
        source_config_path,
        output_config_path: output_config_path.to_path_buf(),
        selection_report_json,
        report,
    })
}
