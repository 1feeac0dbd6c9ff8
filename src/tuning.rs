//! Local search around a known-good espeak profile.
//!
//! Small deltas on speed, pitch, adaptive passes and tolerance are combined,
//! ordered by weighted L1 distance to the base, deduplicated and capped. Each
//! candidate is written as a complete config, benchmarked, and the winner is
//! locked.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::benchmark::{BenchmarkRequest, run_benchmark};
use crate::config::{AppConfig, BackendKind, EspeakConfig, MAX_ADAPTIVE_PASSES, MAX_PITCH};
use crate::error::{DubError, DubResult};
use crate::model::write_json;
use crate::pipeline::CancellationToken;
use crate::report::{TUNING_REPORT_FILE, write_tuning_report};
use crate::selection::lock_recommended_profile;

pub const TUNING_STAGE: &str = "tts_tuning";
pub const TUNING_META_FILE: &str = "tuning_meta.json";
pub const CANDIDATE_CONFIG_DIR: &str = "configs";
pub const DEFAULT_MAX_CANDIDATES: usize = 16;

const SPEED_DELTAS: [i64; 7] = [-30, -20, -10, 0, 10, 20, 30];
const PITCH_DELTAS: [i64; 5] = [-12, -6, 0, 6, 12];
const MIN_TOLERANCE_SECONDS: f64 = 0.02;
const MAX_TOLERANCE_SECONDS: f64 = 0.15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningCandidate {
    pub speed_wpm: u32,
    pub pitch: u32,
    pub adaptive_max_passes: u32,
    pub adaptive_tolerance_seconds: f64,
    /// Weighted L1 distance to the base profile.
    pub distance: f64,
}

impl TuningCandidate {
    #[must_use]
    pub fn profile_name(&self) -> String {
        format!(
            "espeak_s{}_p{}_m{}_t{}",
            self.speed_wpm,
            self.pitch,
            self.adaptive_max_passes,
            self.adaptive_tolerance_seconds.to_string().replace('.', "_")
        )
    }

    /// `index` is one-based.
    #[must_use]
    pub fn file_name(&self, index: usize) -> String {
        format!("{index:02}_{}.toml", self.profile_name())
    }

    /// The base config with this candidate's espeak parameters applied.
    #[must_use]
    pub fn apply(&self, base: &AppConfig) -> AppConfig {
        let mut config = base.clone();
        config.tts.backend = BackendKind::Espeak;
        let espeak = &mut config.tts.espeak;
        espeak.speed_wpm = self.speed_wpm;
        espeak.pitch = self.pitch;
        espeak.adaptive_rate_enabled = true;
        espeak.adaptive_max_passes = self.adaptive_max_passes;
        espeak.adaptive_tolerance_seconds = self.adaptive_tolerance_seconds;
        config
    }

    fn identity(&self) -> (u32, u32, u32, i64) {
        (
            self.speed_wpm,
            self.pitch,
            self.adaptive_max_passes,
            (self.adaptive_tolerance_seconds * 1000.0).round() as i64,
        )
    }
}

fn round_millis(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn sorted_unique(mut values: Vec<u32>) -> Vec<u32> {
    values.sort_unstable();
    values.dedup();
    values
}

/// Candidate grid around `base`, nearest first, at most `max_candidates` long.
/// Every value stays inside the adaptive wpm range, pitch 0..=99, passes
/// 1..=8 and tolerance 0.02..=0.15.
#[must_use]
pub fn generate_candidates(base: &EspeakConfig, max_candidates: usize) -> Vec<TuningCandidate> {
    let min_wpm = i64::from(base.adaptive_min_wpm.min(base.adaptive_max_wpm));
    let max_wpm = i64::from(base.adaptive_max_wpm);
    let speeds = sorted_unique(
        SPEED_DELTAS
            .iter()
            .map(|delta| (i64::from(base.speed_wpm) + delta).clamp(min_wpm, max_wpm) as u32)
            .collect(),
    );
    let pitches = sorted_unique(
        PITCH_DELTAS
            .iter()
            .map(|delta| (i64::from(base.pitch) + delta).clamp(0, i64::from(MAX_PITCH)) as u32)
            .collect(),
    );
    let passes = sorted_unique(
        [
            base.adaptive_max_passes.saturating_sub(1),
            base.adaptive_max_passes,
            base.adaptive_max_passes.saturating_add(1),
        ]
        .iter()
        .map(|value| (*value).clamp(1, MAX_ADAPTIVE_PASSES))
        .collect(),
    );
    let base_tolerance = base.adaptive_tolerance_seconds;
    let mut tolerances: Vec<f64> = [base_tolerance * 0.75, base_tolerance, base_tolerance * 1.25]
        .iter()
        .map(|value| value.clamp(MIN_TOLERANCE_SECONDS, MAX_TOLERANCE_SECONDS))
        .collect();
    tolerances.sort_by(f64::total_cmp);
    tolerances.dedup();

    let mut raw = Vec::with_capacity(speeds.len() * pitches.len() * passes.len() * tolerances.len());
    for speed in &speeds {
        for pitch in &pitches {
            for pass in &passes {
                for tolerance in &tolerances {
                    let distance = f64::from(speed.abs_diff(base.speed_wpm)) / 10.0
                        + f64::from(pitch.abs_diff(base.pitch)) / 6.0
                        + f64::from(pass.abs_diff(base.adaptive_max_passes)) * 0.8
                        + (tolerance - base_tolerance).abs() / 0.02;
                    raw.push(TuningCandidate {
                        speed_wpm: *speed,
                        pitch: *pitch,
                        adaptive_max_passes: *pass,
                        adaptive_tolerance_seconds: round_millis(*tolerance),
                        distance,
                    });
                }
            }
        }
    }
    raw.sort_by(|left, right| left.distance.total_cmp(&right.distance));

    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|candidate| seen.insert(candidate.identity()))
        .take(max_candidates)
        .collect()
}

#[derive(Debug, Clone)]
pub struct TuningRequest {
    pub tts_input_json: PathBuf,
    pub base_config_path: PathBuf,
    pub output_dir: PathBuf,
    pub locked_config_path: PathBuf,
    pub max_candidates: usize,
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningMeta {
    pub stage: String,
    pub generated_at_utc: String,
    pub tts_input_json: String,
    pub base_config_path: String,
    pub generated_config_count: usize,
    pub generated_config_paths: Vec<String>,
    pub benchmark_report_json: String,
    pub tuning_report_markdown: String,
    pub recommended_profile: String,
    pub recommended_config_path: String,
    pub selection_report_json: String,
}

#[derive(Debug, Clone)]
pub struct TuningArtifacts {
    pub candidates: Vec<TuningCandidate>,
    pub generated_config_paths: Vec<PathBuf>,
    pub benchmark_report_json: PathBuf,
    pub tuning_report_markdown: PathBuf,
    pub recommended_profile: String,
    pub recommended_config_path: PathBuf,
    pub selection_report_json: PathBuf,
    pub meta_json: PathBuf,
}

/// Write one full config per candidate under `config_dir`.
pub fn write_candidate_configs(
    base: &AppConfig,
    candidates: &[TuningCandidate],
    config_dir: &Path,
) -> DubResult<Vec<PathBuf>> {
    candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| {
            let path = config_dir.join(candidate.file_name(index + 1));
            candidate.apply(base).write_toml(&path)?;
            Ok(path)
        })
        .collect()
}

/// Generate, benchmark, report and lock in one pass.
pub fn run_tuning(request: &TuningRequest, token: &CancellationToken) -> DubResult<TuningArtifacts> {
    if !request.tts_input_json.is_file() {
        return Err(DubError::InputNotFound(request.tts_input_json.clone()));
    }
    if request.max_candidates == 0 {
        return Err(DubError::InvalidConfig(
            "max_candidates must be greater than 0".to_owned(),
        ));
    }
    let base = AppConfig::load(Some(&request.base_config_path))?;
    if base.tts.backend != BackendKind::Espeak {
        return Err(DubError::InvalidConfig(format!(
            "tuning base config must use tts.backend = \"espeak\", found \"{}\"",
            base.tts.backend
        )));
    }

    let candidates = generate_candidates(&base.tts.espeak, request.max_candidates);
    let generated_config_paths = write_candidate_configs(
        &base,
        &candidates,
        &request.output_dir.join(CANDIDATE_CONFIG_DIR),
    )?;
    tracing::info!(
        candidates = candidates.len(),
        base = %request.base_config_path.display(),
        "tuning candidates written"
    );

    let benchmark = run_benchmark(
        &BenchmarkRequest {
            tts_input_json: request.tts_input_json.clone(),
            config_paths: generated_config_paths.clone(),
            output_dir: request.output_dir.clone(),
            workers: request.workers,
        },
        token,
    )?;
    let tuning_report_markdown = write_tuning_report(
        &benchmark.report_json,
        Some(&request.output_dir.join(TUNING_REPORT_FILE)),
    )?;
    let selection = lock_recommended_profile(
        &benchmark.report_json,
        &request.locked_config_path,
        None,
    )?;

    let meta_json = request.output_dir.join(TUNING_META_FILE);
    let meta = TuningMeta {
        stage: TUNING_STAGE.to_owned(),
        generated_at_utc: Utc::now().to_rfc3339(),
        tts_input_json: request.tts_input_json.display().to_string(),
        base_config_path: request.base_config_path.display().to_string(),
        generated_config_count: generated_config_paths.len(),
        generated_config_paths: generated_config_paths
            .iter()
            .map(|path| path.display().to_string())
            .collect(),
        benchmark_report_json: benchmark.report_json.display().to_string(),
        tuning_report_markdown: tuning_report_markdown.display().to_string(),
        recommended_profile: selection.recommended_profile.clone(),
        recommended_config_path: selection.output_config_path.display().to_string(),
        selection_report_json: selection.selection_report_json.display().to_string(),
    };
    write_json(&meta_json, &meta)?;

    Ok(TuningArtifacts {
        candidates,
        generated_config_paths,
        benchmark_report_json: benchmark.report_json,
        tuning_report_markdown,
        recommended_profile: selection.recommended_profile,
        recommended_config_path: selection.output_config_path,
        selection_report_json: selection.selection_report_json,
        meta_json,
    })
}
