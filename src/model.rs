use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DubError, DubResult};
use crate::postfit::PostfitSummary;
use crate::qa::GateDecision;

pub const SCHEMA_VERSION: &str = "1.0";
pub const TRANSLATION_OUTPUT_STAGE: &str = "translation_output";
pub const TTS_INPUT_STAGE: &str = "tts_input";
pub const TTS_OUTPUT_STAGE: &str = "tts_output";

/// One timed unit of translated speech with the window it has to fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsInputSegment {
    pub id: u32,
    pub start: f64,
    pub end: f64,
    pub duration: f64,
    pub target_text: String,
    pub target_word_count: u32,
}

impl TtsInputSegment {
    #[must_use]
    pub fn target_duration(&self) -> f64 {
        self.duration.max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsInputDocument {
    pub schema_version: String,
    pub stage: String,
    pub generated_at_utc: String,
    pub language: String,
    pub segment_count: usize,
    pub total_target_word_count: u64,
    pub segments: Vec<TtsInputSegment>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    id: Option<u32>,
    start: Option<f64>,
    end: Option<f64>,
    duration: Option<f64>,
    target_text: Option<String>,
    target_word_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawTtsInput {
    schema_version: Option<String>,
    stage: Option<String>,
    generated_at_utc: Option<String>,
    language: Option<String>,
    segment_count: Option<usize>,
    total_target_word_count: Option<u64>,
    #[serde(default)]
    segments: Vec<RawSegment>,
}

#[derive(Debug, Deserialize)]
struct RawTranslationOutput {
    stage: Option<String>,
    target_language: Option<String>,
    #[serde(default)]
    segments: Vec<RawSegment>,
}

#[must_use]
pub fn count_words(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

fn contract_error(context: &str, err: serde_json::Error) -> DubError {
    DubError::InvalidContract(format!("{context}: {err}"))
}

fn require_stage(found: Option<&str>, expected: &str) -> DubResult<()> {
    let found = found.map(str::trim).unwrap_or_default();
    if found == expected {
        Ok(())
    } else {
        Err(DubError::InvalidContract(format!(
            "expected stage `{expected}`, found `{found}`"
        )))
    }
}

fn normalize_segments(raw: Vec<RawSegment>) -> Vec<TtsInputSegment> {
    let mut segments = Vec::with_capacity(raw.len());
    for item in raw {
        let target_text = item.target_text.unwrap_or_default().trim().to_owned();
        let start = item.start.unwrap_or(0.0);
        let end = item.end.unwrap_or(start);
        let duration = item.duration.unwrap_or(end - start).max(0.0);
        let fallback_id = u32::try_from(segments.len()).unwrap_or(u32::MAX);
        segments.push(TtsInputSegment {
            id: item.id.unwrap_or(fallback_id),
            start,
            end,
            duration,
            target_word_count: item
                .target_word_count
                .unwrap_or_else(|| count_words(&target_text)),
            target_text,
        });
    }
    segments
}

fn total_words(segments: &[TtsInputSegment]) -> u64 {
    segments
        .iter()
        .map(|segment| u64::from(segment.target_word_count))
        .sum()
}

impl TtsInputDocument {
    /// Parse a `tts_input` document. Missing `duration` falls back to
    /// `end - start`, missing `end` to `start`, negative durations clamp to 0.
    pub fn from_json_value(payload: Value) -> DubResult<Self> {
        if !payload.is_object() {
            return Err(DubError::InvalidContract(
                "tts input root must be a JSON object".to_owned(),
            ));
        }
        let raw: RawTtsInput =
            serde_json::from_value(payload).map_err(|err| contract_error("tts input", err))?;
        require_stage(raw.stage.as_deref(), TTS_INPUT_STAGE)?;
        let language = raw.language.unwrap_or_default().trim().to_owned();
        if language.is_empty() {
            return Err(DubError::InvalidContract(
                "tts input requires a language".to_owned(),
            ));
        }

        let segments = normalize_segments(raw.segments);
        Ok(Self {
            schema_version: raw
                .schema_version
                .unwrap_or_else(|| SCHEMA_VERSION.to_owned()),
            stage: TTS_INPUT_STAGE.to_owned(),
            generated_at_utc: raw.generated_at_utc.unwrap_or_default(),
            language,
            segment_count: raw.segment_count.unwrap_or(segments.len()),
            total_target_word_count: raw
                .total_target_word_count
                .unwrap_or_else(|| total_words(&segments)),
            segments,
        })
    }

    pub fn from_json_bytes(bytes: &[u8]) -> DubResult<Self> {
        let payload: Value =
            serde_json::from_slice(bytes).map_err(|err| contract_error("tts input", err))?;
        Self::from_json_value(payload)
    }

    /// Build a fresh `tts_input` document from upstream translation output.
    pub fn from_translation_output(
        payload: Value,
        language_override: Option<&str>,
    ) -> DubResult<Self> {
        if !payload.is_object() {
            return Err(DubError::InvalidContract(
                "translation output root must be a JSON object".to_owned(),
            ));
        }
        let raw: RawTranslationOutput = serde_json::from_value(payload)
            .map_err(|err| contract_error("translation output", err))?;
        require_stage(raw.stage.as_deref(), TRANSLATION_OUTPUT_STAGE)?;

        let mut language = raw.target_language.unwrap_or_default().trim().to_owned();
        if let Some(value) = language_override
            && !value.trim().is_empty()
        {
            language = value.trim().to_owned();
        }
        if language.is_empty() {
            return Err(DubError::InvalidContract(
                "translation output requires a target language".to_owned(),
            ));
        }

        let segments = normalize_segments(raw.segments);
        Ok(Self {
            schema_version: SCHEMA_VERSION.to_owned(),
            stage: TTS_INPUT_STAGE.to_owned(),
            generated_at_utc: Utc::now().to_rfc3339(),
            language,
            segment_count: segments.len(),
            total_target_word_count: total_words(&segments),
            segments,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostfitAction {
    #[default]
    None,
    Pad,
    Trim,
}

/// What the backend produced for one segment before any correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub segment_id: u32,
    pub audio_path: PathBuf,
    pub produced_duration: f64,
    pub duration_delta: f64,
    pub attempts: u32,
    pub final_speed_wpm: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostfitOutcome {
    pub segment_id: u32,
    pub action: PostfitAction,
    pub adjusted_seconds: f64,
    pub final_duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsOutputSegment {
    pub id: u32,
    pub start: f64,
    pub end: f64,
    pub target_duration: f64,
    pub synthesized_duration: f64,
    pub duration_delta: f64,
    pub target_text: String,
    pub audio_path: String,
    #[serde(default)]
    pub postfit_action: PostfitAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsOutputDocument {
    pub schema_version: String,
    pub stage: String,
    pub generated_at_utc: String,
    pub backend: String,
    pub language: String,
    pub sample_rate: u32,
    pub segment_count: usize,
    pub segments: Vec<TtsOutputSegment>,
}

impl TtsOutputDocument {
    /// Pair every input segment with its final audio. The synthesized
    /// duration recorded here is the post-correction one.
    pub fn build(
        input: &TtsInputDocument,
        backend: &str,
        sample_rate: u32,
        results: &[SynthesisResult],
        outcomes: &[PostfitOutcome],
    ) -> DubResult<Self> {
        if results.len() != input.segments.len() || outcomes.len() != input.segments.len() {
            return Err(DubError::InvalidContract(format!(
                "segment count mismatch: {} input, {} synthesized, {} postfit",
                input.segments.len(),
                results.len(),
                outcomes.len()
            )));
        }

        let segments = input
            .segments
            .iter()
            .zip(results)
            .zip(outcomes)
            .map(|((segment, result), outcome)| {
                let target_duration = segment.target_duration();
                TtsOutputSegment {
                    id: segment.id,
                    start: segment.start,
                    end: segment.end,
                    target_duration,
                    synthesized_duration: outcome.final_duration,
                    duration_delta: outcome.final_duration - target_duration,
                    target_text: segment.target_text.clone(),
                    audio_path: result.audio_path.display().to_string(),
                    postfit_action: outcome.action,
                }
            })
            .collect::<Vec<_>>();

        Ok(Self {
            schema_version: SCHEMA_VERSION.to_owned(),
            stage: TTS_OUTPUT_STAGE.to_owned(),
            generated_at_utc: Utc::now().to_rfc3339(),
            backend: backend.to_owned(),
            language: input.language.clone(),
            sample_rate,
            segment_count: segments.len(),
            segments,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    pub ts_rfc3339: String,
    pub stage: String,
    pub code: String,
    pub message: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestInputs {
    pub tts_input_json: String,
    pub tts_input_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestOutputs {
    pub tts_output_json: String,
    pub qa_report_json: String,
    pub segment_audio_dir: String,
    pub stitched_preview_wav: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub read_input: f64,
    pub synthesize_segments: f64,
    pub build_output_contract: f64,
    pub build_qa_report: f64,
    pub write_outputs: f64,
    pub total_pipeline: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub stage: String,
    pub backend: String,
    pub started_at_rfc3339: String,
    pub finished_at_rfc3339: String,
    pub inputs: ManifestInputs,
    pub outputs: ManifestOutputs,
    pub timings_seconds: StageTimings,
    pub postfit: PostfitSummary,
    pub qa_gate: GateDecision,
    pub events: Vec<RunEvent>,
}

pub fn read_json_value(path: &Path) -> DubResult<Value> {
    if !path.is_file() {
        return Err(DubError::InputNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|err| DubError::InvalidContract(format!("{}: {err}", path.display())))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> DubResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut rendered = serde_json::to_string_pretty(value)?;
    rendered.push('\n');
    fs::write(path, rendered)?;
    Ok(())
}
