//! Run one input through N configuration profiles and rank them.
//!
//! Profiles are independent pipelines with their own output directories.
//! They run on a bounded rayon pool; a failing profile is recorded and never
//! aborts its siblings.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::backend::build_synthesizer;
use crate::config::AppConfig;
use crate::error::{DubError, DubResult};
use crate::model::{read_json_value, write_json};
use crate::pipeline::{
    CancellationToken, QA_REPORT_FILE, RUN_MANIFEST_FILE, RunRequest, TTS_OUTPUT_FILE,
    run_dub_with_synthesizer,
};
use crate::qa::QualityFlag;

pub const BENCHMARK_STAGE: &str = "tts_benchmark";
pub const BENCHMARK_REPORT_FILE: &str = "profile_benchmark.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Ok,
    FailedPreflight,
    FailedRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkProfileResult {
    pub profile_name: String,
    pub config_path: String,
    pub status: ProfileStatus,
    pub output_dir: Option<String>,
    pub tts_output_json: Option<String>,
    pub qa_report_json: Option<String>,
    pub run_manifest_json: Option<String>,
    pub stitched_preview_wav: Option<String>,
    pub total_pipeline_seconds: Option<f64>,
    pub max_abs_duration_delta_seconds: Option<f64>,
    pub quality_flag_count: Option<usize>,
    #[serde(default)]
    pub quality_flags: Vec<QualityFlag>,
    pub postfit_padding_segments: Option<usize>,
    pub postfit_trim_segments: Option<usize>,
    pub postfit_total_padded_seconds: Option<f64>,
    pub postfit_total_trimmed_seconds: Option<f64>,
    pub error: Option<String>,
}

impl BenchmarkProfileResult {
    fn failed(
        profile_name: &str,
        config_path: &Path,
        status: ProfileStatus,
        error: String,
    ) -> Self {
        Self {
            profile_name: profile_name.to_owned(),
            config_path: config_path.display().to_string(),
            status,
            output_dir: None,
            tts_output_json: None,
            qa_report_json: None,
            run_manifest_json: None,
            stitched_preview_wav: None,
            total_pipeline_seconds: None,
            max_abs_duration_delta_seconds: None,
            quality_flag_count: None,
            quality_flags: Vec::new(),
            postfit_padding_segments: None,
            postfit_trim_segments: None,
            postfit_total_padded_seconds: None,
            postfit_total_trimmed_seconds: None,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ProfileStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    pub profile_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub recommended_profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub stage: String,
    pub generated_at_utc: String,
    pub tts_input_json: String,
    pub profiles: Vec<BenchmarkProfileResult>,
    pub ranking: Vec<String>,
    pub summary: BenchmarkSummary,
}

impl BenchmarkReport {
    #[must_use]
    pub fn recommended(&self) -> Option<&BenchmarkProfileResult> {
        let name = self.summary.recommended_profile.as_deref()?;
        self.profiles.iter().find(|profile| profile.profile_name == name)
    }

    pub fn load(path: &Path) -> DubResult<Self> {
        let payload = read_json_value(path)?;
        let stage = payload
            .get("stage")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if stage != BENCHMARK_STAGE {
            return Err(DubError::InvalidContract(format!(
                "expected stage `{BENCHMARK_STAGE}` in {}, found `{stage}`",
                path.display()
            )));
        }
        serde_json::from_value(payload)
            .map_err(|err| DubError::InvalidContract(format!("{}: {err}", path.display())))
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkRequest {
    pub tts_input_json: PathBuf,
    pub config_paths: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct BenchmarkArtifacts {
    pub report: BenchmarkReport,
    pub report_json: PathBuf,
}

/// Lowercase, with every run of non-alphanumerics collapsed to `_`.
#[must_use]
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let trimmed = slug.trim_matches('_');
    if trimmed.is_empty() {
        "profile".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Profile names from config stems; repeated stems become `stem_2`, `stem_3`, ...
/// skipping any name already taken, so every label is distinct.
#[must_use]
pub fn profile_labels(config_paths: &[PathBuf]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::new();
    config_paths
        .iter()
        .map(|path| {
            let stem = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "profile".to_owned());
            let mut label = stem.clone();
            let mut suffix = 2;
            while !taken.insert(label.clone()) {
                label = format!("{stem}_{suffix}");
                suffix += 1;
            }
            label
        })
        .collect()
}

fn unique_slugs(labels: &[String]) -> Vec<String> {
    let mut taken = HashSet::new();
    labels
        .iter()
        .map(|label| {
            let base = slugify(label);
            let mut candidate = base.clone();
            let mut suffix = 2;
            while !taken.insert(candidate.clone()) {
                candidate = format!("{base}_{suffix}");
                suffix += 1;
            }
            candidate
        })
        .collect()
}

fn compare_profiles(left: &BenchmarkProfileResult, right: &BenchmarkProfileResult) -> Ordering {
    let flags = |p: &BenchmarkProfileResult| p.quality_flag_count.unwrap_or(usize::MAX);
    let delta = |p: &BenchmarkProfileResult| p.max_abs_duration_delta_seconds.unwrap_or(f64::INFINITY);
    let seconds = |p: &BenchmarkProfileResult| p.total_pipeline_seconds.unwrap_or(f64::INFINITY);
    flags(left)
        .cmp(&flags(right))
        .then_with(|| delta(left).total_cmp(&delta(right)))
        .then_with(|| seconds(left).total_cmp(&seconds(right)))
        .then_with(|| left.profile_name.cmp(&right.profile_name))
}

/// Successful profiles ordered by flag count, then worst duration delta,
/// then wall time. Names break exact ties so the order never depends on
/// input order.
#[must_use]
pub fn rank_profiles(results: &[BenchmarkProfileResult]) -> Vec<String> {
    let mut successful: Vec<&BenchmarkProfileResult> =
        results.iter().filter(|result| result.is_ok()).collect();
    successful.sort_by(|left, right| compare_profiles(left, right));
    successful
        .into_iter()
        .map(|result| result.profile_name.clone())
        .collect()
}

#[must_use]
pub fn build_report(tts_input_json: &Path, profiles: Vec<BenchmarkProfileResult>) -> BenchmarkReport {
    let ranking = rank_profiles(&profiles);
    let success_count = profiles.iter().filter(|profile| profile.is_ok()).count();
    let summary = BenchmarkSummary {
        profile_count: profiles.len(),
        success_count,
        failed_count: profiles.len() - success_count,
        recommended_profile: ranking.first().cloned(),
    };
    BenchmarkReport {
        stage: BENCHMARK_STAGE.to_owned(),
        generated_at_utc: Utc::now().to_rfc3339(),
        tts_input_json: tts_input_json.display().to_string(),
        profiles,
        ranking,
        summary,
    }
}

fn existing(path: PathBuf) -> Option<String> {
    path.exists().then(|| path.display().to_string())
}

fn run_profile(
    tts_input_json: &Path,
    config_path: &Path,
    profile_name: &str,
    output_dir: &Path,
    token: &CancellationToken,
) -> BenchmarkProfileResult {
    let started = Instant::now();
    if let Err(err) = token.checkpoint() {
        return BenchmarkProfileResult::failed(
            profile_name,
            config_path,
            ProfileStatus::FailedRun,
            err.to_string(),
        );
    }

    let config = match AppConfig::load(Some(config_path)) {
        Ok(config) => config,
        Err(err) => {
            return BenchmarkProfileResult::failed(
                profile_name,
                config_path,
                ProfileStatus::FailedPreflight,
                err.to_string(),
            );
        }
    };
    let synthesizer = match build_synthesizer(&config.tts) {
        Ok(synthesizer) => synthesizer,
        Err(err) => {
            return BenchmarkProfileResult::failed(
                profile_name,
                config_path,
                ProfileStatus::FailedPreflight,
                err.to_string(),
            );
        }
    };
    let issues = synthesizer.preflight();
    if !issues.is_empty() {
        tracing::warn!(profile = profile_name, ?issues, "profile failed preflight");
        return BenchmarkProfileResult::failed(
            profile_name,
            config_path,
            ProfileStatus::FailedPreflight,
            issues.join("; "),
        );
    }

    let request = RunRequest {
        tts_input_json: tts_input_json.to_path_buf(),
        output_dir: output_dir.to_path_buf(),
    };
    match run_dub_with_synthesizer(&request, &config, synthesizer.as_ref(), token) {
        Ok(artifacts) => {
            tracing::info!(
                profile = profile_name,
                flags = artifacts.qa_report.quality_flags.len(),
                max_abs_delta = artifacts.qa_report.duration_metrics.max_abs_delta_seconds,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "profile benchmarked"
            );
            BenchmarkProfileResult {
                profile_name: profile_name.to_owned(),
                config_path: config_path.display().to_string(),
                status: ProfileStatus::Ok,
                output_dir: Some(output_dir.display().to_string()),
                tts_output_json: Some(artifacts.tts_output_json.display().to_string()),
                qa_report_json: Some(artifacts.qa_report_json.display().to_string()),
                run_manifest_json: Some(artifacts.run_manifest_json.display().to_string()),
                stitched_preview_wav: Some(artifacts.preview.path.display().to_string()),
                total_pipeline_seconds: Some(artifacts.timings.total_pipeline),
                max_abs_duration_delta_seconds: Some(
                    artifacts.qa_report.duration_metrics.max_abs_delta_seconds,
                ),
                quality_flag_count: Some(artifacts.qa_report.quality_flags.len()),
                quality_flags: artifacts.qa_report.quality_flags.clone(),
                postfit_padding_segments: Some(artifacts.postfit.padded_segments),
                postfit_trim_segments: Some(artifacts.postfit.trimmed_segments),
                postfit_total_padded_seconds: Some(artifacts.postfit.total_padded_seconds),
                postfit_total_trimmed_seconds: Some(artifacts.postfit.total_trimmed_seconds),
                error: None,
            }
        }
        Err(err) => {
            tracing::warn!(profile = profile_name, error = %err, "profile run failed");
            let mut result = BenchmarkProfileResult::failed(
                profile_name,
                config_path,
                ProfileStatus::FailedRun,
                err.to_string(),
            );
            result.output_dir = existing(output_dir.to_path_buf());
            result.tts_output_json = existing(output_dir.join(TTS_OUTPUT_FILE));
            result.qa_report_json = existing(output_dir.join(QA_REPORT_FILE));
            result.run_manifest_json = existing(output_dir.join(RUN_MANIFEST_FILE));
            result
        }
    }
}

/// Benchmark every config in `request.config_paths` against the same input
/// and write `profile_benchmark.json` under `request.output_dir`.
pub fn run_benchmark(
    request: &BenchmarkRequest,
    token: &CancellationToken,
) -> DubResult<BenchmarkArtifacts> {
    if !request.tts_input_json.is_file() {
        return Err(DubError::InputNotFound(request.tts_input_json.clone()));
    }
    if request.config_paths.is_empty() {
        return Err(DubError::InvalidConfig(
            "at least one config path is required for a benchmark".to_owned(),
        ));
    }
    token.checkpoint()?;

    let labels = profile_labels(&request.config_paths);
    let slugs = unique_slugs(&labels);
    let profiles_dir = request.output_dir.join("profiles");
    let workers = request.workers.max(1);
    tracing::info!(
        profiles = labels.len(),
        workers,
        output = %request.output_dir.display(),
        "benchmark started"
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|err| DubError::Io(std::io::Error::other(format!("benchmark pool: {err}"))))?;
    let jobs: Vec<(&PathBuf, &String, &String)> = request
        .config_paths
        .iter()
        .zip(&labels)
        .zip(&slugs)
        .map(|((path, label), slug)| (path, label, slug))
        .collect();
    let results: Vec<BenchmarkProfileResult> = pool.install(|| {
        jobs.par_iter()
            .map(|(config_path, label, slug)| {
                run_profile(
                    &request.tts_input_json,
                    config_path,
                    label,
                    &profiles_dir.join(slug.as_str()),
                    token,
                )
            })
            .collect()
    });
    token.checkpoint()?;

    let report = build_report(&request.tts_input_json, results);
    let report_json = request.output_dir.join(BENCHMARK_REPORT_FILE);
    write_json(&report_json, &report)?;
    tracing::info!(
        success = report.summary.success_count,
        failed = report.summary.failed_count,
        recommended = ?report.summary.recommended_profile,
        "benchmark finished"
    );
    Ok(BenchmarkArtifacts {
        report,
        report_json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_profile(name: &str, flags: usize, delta: f64, seconds: f64) -> BenchmarkProfileResult {
        let mut result = BenchmarkProfileResult::failed(
            name,
            Path::new("x.toml"),
            ProfileStatus::Ok,
            String::new(),
        );
        result.error = None;
        result.quality_flag_count = Some(flags);
        result.max_abs_duration_delta_seconds = Some(delta);
        result.total_pipeline_seconds = Some(seconds);
        result
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Espeak Fast-v2"), "espeak_fast_v2");
        assert_eq!(slugify("__a..b__"), "a_b");
        assert_eq!(slugify("---"), "profile");
        assert_eq!(slugify("Türkçe"), "t_rk_e");
    }

    #[test]
    fn duplicate_stems_get_numbered_labels() {
        let labels = profile_labels(&[
            PathBuf::from("a/fast.toml"),
            PathBuf::from("b/fast.toml"),
            PathBuf::from("slow.toml"),
            PathBuf::from("c/fast.toml"),
        ]);
        assert_eq!(labels, vec!["fast", "fast_2", "slow", "fast_3"]);
    }

    #[test]
    fn numbered_label_never_shadows_a_real_stem() {
        let labels = profile_labels(&[
            PathBuf::from("a/fast.toml"),
            PathBuf::from("b/fast.toml"),
            PathBuf::from("c/fast_2.toml"),
        ]);
        assert_eq!(labels, vec!["fast", "fast_2", "fast_2_2"]);
    }

    #[test]
    fn colliding_slugs_are_disambiguated() {
        let slugs = unique_slugs(&["a-b".to_owned(), "a_b".to_owned(), "A B".to_owned()]);
        assert_eq!(slugs, vec!["a_b", "a_b_2", "a_b_3"]);
    }

    #[test]
    fn ranking_orders_by_flags_then_delta_then_time() {
        let results = vec![
            ok_profile("slow_clean", 0, 0.02, 9.0),
            ok_profile("flagged", 1, 0.0, 0.1),
            ok_profile("fast_clean", 0, 0.02, 1.0),
            ok_profile("tight", 0, 0.01, 5.0),
            BenchmarkProfileResult::failed(
                "broken",
                Path::new("b.toml"),
                ProfileStatus::FailedRun,
                "boom".to_owned(),
            ),
        ];
        assert_eq!(
            rank_profiles(&results),
            vec!["tight", "fast_clean", "slow_clean", "flagged"]
        );
    }

    #[test]
    fn reversing_input_keeps_recommendation() {
        let mut results = vec![
            ok_profile("b", 0, 0.05, 1.0),
            ok_profile("a", 0, 0.05, 1.0),
            ok_profile("c", 2, 0.0, 0.5),
        ];
        let forward = build_report(Path::new("in.json"), results.clone());
        results.reverse();
        let reversed = build_report(Path::new("in.json"), results);
        assert_eq!(forward.ranking, reversed.ranking);
        assert_eq!(forward.summary.recommended_profile.as_deref(), Some("a"));
        assert_eq!(
            forward.summary.recommended_profile,
            reversed.summary.recommended_profile
        );
    }

    #[test]
    fn summary_counts_failures_and_handles_no_success() {
        let report = build_report(
            Path::new("in.json"),
            vec![BenchmarkProfileResult::failed(
                "x",
                Path::new("x.toml"),
                ProfileStatus::FailedPreflight,
                "missing".to_owned(),
            )],
        );
        assert_eq!(report.summary.profile_count, 1);
        assert_eq!(report.summary.failed_count, 1);
        assert_eq!(report.summary.recommended_profile, None);
        assert!(report.recommended().is_none());
    }

    #[test]
    fn load_rejects_other_stages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.json");
        write_json(&path, &serde_json::json!({"stage": "tts"})).expect("write");
        let err = BenchmarkReport::load(&path).expect_err("wrong stage");
        assert!(matches!(err, DubError::InvalidContract(_)));

        let report = build_report(Path::new("in.json"), vec![ok_profile("a", 0, 0.0, 1.0)]);
        write_json(&path, &report).expect("write report");
        let loaded = BenchmarkReport::load(&path).expect("load");
        assert_eq!(loaded.recommended().map(|p| p.profile_name.as_str()), Some("a"));
    }
}
