//! End-to-end finish workflow: prepare the input, optionally tune and lock a
//! profile, then run production with the strict gate forced on.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::{DubError, DubResult};
use crate::model::write_json;
use crate::pipeline::{CancellationToken, RunArtifacts, RunRequest, prepare_tts_input, run_dub};
use crate::tuning::{TuningArtifacts, TuningRequest, run_tuning};

pub const CLOSURE_STAGE: &str = "tts_closure";
pub const CLOSURE_REPORT_FILE: &str = "closure_report.json";
pub const TUNING_SUBDIR: &str = "tuning";
pub const RUN_SUBDIR: &str = "run";

#[derive(Debug, Clone)]
pub struct FinishRequest {
    /// When set, `tts_input_json` is regenerated from this document first.
    pub translation_output_json: Option<PathBuf>,
    pub language: Option<String>,
    pub tts_input_json: PathBuf,
    pub base_config_path: PathBuf,
    pub locked_config_path: PathBuf,
    pub output_dir: PathBuf,
    pub auto_tune: bool,
    pub max_candidates: usize,
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosureTuning {
    pub candidate_count: usize,
    pub benchmark_report_json: Option<String>,
    pub tuning_report_markdown: Option<String>,
    pub recommended_profile: Option<String>,
    pub selection_report_json: Option<String>,
}

impl ClosureTuning {
    fn from_artifacts(tuning: Option<&TuningArtifacts>) -> Self {
        let path = |value: &Path| Some(value.display().to_string());
        match tuning {
            Some(tuning) => Self {
                candidate_count: tuning.generated_config_paths.len(),
                benchmark_report_json: path(&tuning.benchmark_report_json),
                tuning_report_markdown: path(&tuning.tuning_report_markdown),
                recommended_profile: Some(tuning.recommended_profile.clone()),
                selection_report_json: path(&tuning.selection_report_json),
            },
            None => Self {
                candidate_count: 0,
                benchmark_report_json: None,
                tuning_report_markdown: None,
                recommended_profile: None,
                selection_report_json: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosureOutputs {
    pub tts_output_json: String,
    pub qa_report_json: String,
    pub run_manifest_json: String,
    pub stitched_preview_wav: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosureReport {
    pub stage: String,
    pub generated_at_utc: String,
    pub language: String,
    pub auto_tune: bool,
    pub tts_input_json: String,
    pub selected_config_path: String,
    pub strict_gate_enabled: bool,
    pub tuning: ClosureTuning,
    pub outputs: ClosureOutputs,
}

#[derive(Debug, Clone)]
pub struct FinishArtifacts {
    pub tts_input_json: PathBuf,
    pub selected_config_path: PathBuf,
    pub tuning: Option<TuningArtifacts>,
    pub run: RunArtifacts,
    pub closure_report_json: PathBuf,
}

/// `config` with the strict quality gate switched on. The allow-list is kept.
#[must_use]
pub fn with_strict_gate(mut config: AppConfig) -> AppConfig {
    config.qa.fail_on_flags = true;
    config
}

pub fn run_finish(request: &FinishRequest, token: &CancellationToken) -> DubResult<FinishArtifacts> {
    let language = match &request.translation_output_json {
        Some(upstream) => {
            prepare_tts_input(upstream, &request.tts_input_json, request.language.as_deref())?
                .language
        }
        None => {
            if !request.tts_input_json.is_file() {
                return Err(DubError::InputNotFound(request.tts_input_json.clone()));
            }
            request.language.clone().unwrap_or_default()
        }
    };
    token.checkpoint()?;

    let tuning = if request.auto_tune {
        Some(run_tuning(
            &TuningRequest {
                tts_input_json: request.tts_input_json.clone(),
                base_config_path: request.base_config_path.clone(),
                output_dir: request.output_dir.join(TUNING_SUBDIR),
                locked_config_path: request.locked_config_path.clone(),
                max_candidates: request.max_candidates,
                workers: request.workers,
            },
            token,
        )?)
    } else {
        None
    };
    let selected_config_path = tuning.as_ref().map_or_else(
        || request.locked_config_path.clone(),
        |tuning| tuning.recommended_config_path.clone(),
    );
    if !selected_config_path.is_file() {
        return Err(DubError::InputNotFound(selected_config_path));
    }

    let config = with_strict_gate(AppConfig::load(Some(&selected_config_path))?);
    tracing::info!(
        config = %selected_config_path.display(),
        backend = %config.tts.backend,
        "strict production run started"
    );
    let run = run_dub(
        &RunRequest {
            tts_input_json: request.tts_input_json.clone(),
            output_dir: request.output_dir.join(RUN_SUBDIR),
        },
        &config,
        token,
    )?;

    let language = if language.is_empty() {
        run.qa_report.language.clone()
    } else {
        language
    };
    let report = ClosureReport {
        stage: CLOSURE_STAGE.to_owned(),
        generated_at_utc: Utc::now().to_rfc3339(),
        language,
        auto_tune: request.auto_tune,
        tts_input_json: request.tts_input_json.display().to_string(),
        selected_config_path: selected_config_path.display().to_string(),
        strict_gate_enabled: true,
        tuning: ClosureTuning::from_artifacts(tuning.as_ref()),
        outputs: ClosureOutputs {
            tts_output_json: run.tts_output_json.display().to_string(),
            qa_report_json: run.qa_report_json.display().to_string(),
            run_manifest_json: run.run_manifest_json.display().to_string(),
            stitched_preview_wav: run.preview.path.display().to_string(),
        },
    };
    let closure_report_json = request.output_dir.join(CLOSURE_REPORT_FILE);
    write_json(&closure_report_json, &report)?;
    tracing::info!(report = %closure_report_json.display(), "finish workflow complete");

    Ok(FinishArtifacts {
        tts_input_json: request.tts_input_json.clone(),
        selected_config_path,
        tuning,
        run,
        closure_report_json,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;
    use crate::qa::QualityFlag;

    fn upstream(dir: &Path) -> PathBuf {
        let path = dir.join("translation_output.json");
        write_json(
            &path,
            &json!({
                "stage": "translation_output",
                "target_language": "tr",
                "segments": [
                    {"id": 0, "start": 0.0, "end": 0.4, "target_text": "bir"},
                    {"id": 1, "start": 0.4, "end": 0.9, "target_text": "iki"}
                ]
            }),
        )
        .expect("write upstream");
        path
    }

    fn request(dir: &Path, locked: PathBuf) -> FinishRequest {
        FinishRequest {
            translation_output_json: Some(upstream(dir)),
            language: None,
            tts_input_json: dir.join("tts_input.tr.json"),
            base_config_path: dir.join("base.toml"),
            locked_config_path: locked,
            output_dir: dir.join("finish"),
            auto_tune: false,
            max_candidates: 4,
            workers: 1,
        }
    }

    #[test]
    fn strict_gate_keeps_allow_list() {
        let mut config = AppConfig::default();
        config.qa.allowed_flags = vec![QualityFlag::EmptyTtsTextPresent];
        let strict = with_strict_gate(config);
        assert!(strict.qa.fail_on_flags);
        assert_eq!(strict.qa.allowed_flags, vec![QualityFlag::EmptyTtsTextPresent]);
    }

    #[test]
    fn finish_without_tuning_uses_locked_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let locked = dir.path().join("locked.toml");
        fs::write(&locked, "[tts]\nbackend = \"tone\"\nsample_rate = 8000\n").expect("write locked");
        let artifacts = run_finish(&request(dir.path(), locked.clone()), &CancellationToken::new())
            .expect("finish");
        assert_eq!(artifacts.selected_config_path, locked);
        assert!(artifacts.tuning.is_none());
        assert!(artifacts.run.qa_gate.enabled);
        assert!(artifacts.run.qa_gate.passed);

        let report: ClosureReport = serde_json::from_slice(
            &fs::read(&artifacts.closure_report_json).expect("read report"),
        )
        .expect("parse report");
        assert_eq!(report.stage, CLOSURE_STAGE);
        assert_eq!(report.language, "tr");
        assert!(report.strict_gate_enabled);
        assert_eq!(report.tuning.candidate_count, 0);
    }

    #[test]
    fn missing_locked_config_is_input_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = run_finish(
            &request(dir.path(), dir.path().join("absent.toml")),
            &CancellationToken::new(),
        )
        .expect_err("no locked config");
        assert!(matches!(err, DubError::InputNotFound(_)));
    }
}
