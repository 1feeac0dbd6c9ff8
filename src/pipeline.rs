//! Single production run: synthesize every segment, fit durations, write the
//! output contract and QA report, stitch the preview, record the manifest and
//! finally evaluate the strict gate.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::backend::{SynthesisRequest, Synthesizer, build_synthesizer};
use crate::config::AppConfig;
use crate::error::{DubError, DubResult};
use crate::mixer::{PreviewSummary, stitch_preview};
use crate::model::{
    ManifestInputs, ManifestOutputs, PostfitAction, RunEvent, RunManifest, StageTimings,
    SynthesisResult, TtsInputDocument, TtsOutputDocument, read_json_value, write_json,
};
use crate::postfit::{PostfitCorrector, PostfitSummary};
use crate::qa::{GateDecision, QA_STAGE, QualityReport, build_quality_report, evaluate_gate};

pub const TTS_OUTPUT_FILE: &str = "tts_output.json";
pub const QA_REPORT_FILE: &str = "tts_qa_report.json";
pub const RUN_MANIFEST_FILE: &str = "tts_run_manifest.json";
pub const SEGMENT_DIR: &str = "segments";

/// Cooperative cancellation, checked at segment boundaries and while waiting
/// on external synthesizers.
///
/// Clones share one flag. A token also observes the process-wide Ctrl+C flag
/// and an optional wall-clock deadline.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<DateTime<Utc>>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_deadline_from_now(duration: std::time::Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self {
            cancelled: Arc::default(),
            deadline: Utc::now().checked_add_signed(chrono::Duration::milliseconds(millis)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.checkpoint().is_err()
    }

    pub fn checkpoint(&self) -> DubResult<()> {
        if crate::cli::ShutdownController::is_shutting_down() {
            return Err(DubError::Cancelled("run cancelled via Ctrl+C".to_owned()));
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(DubError::Cancelled("run cancelled".to_owned()));
        }
        if let Some(deadline) = self.deadline
            && Utc::now() >= deadline
        {
            return Err(DubError::Cancelled("run deadline exceeded".to_owned()));
        }
        Ok(())
    }
}

struct EventLog {
    seq: u64,
    events: Vec<RunEvent>,
}

impl EventLog {
    fn new() -> Self {
        Self {
            seq: 0,
            events: Vec::new(),
        }
    }

    fn push(&mut self, stage: &str, code: &str, message: &str, payload: Value) {
        self.seq += 1;
        tracing::debug!(stage, code, message, "run event");
        self.events.push(RunEvent {
            seq: self.seq,
            ts_rfc3339: Utc::now().to_rfc3339(),
            stage: stage.to_owned(),
            code: code.to_owned(),
            message: message.to_owned(),
            payload,
        });
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub tts_input_json: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub run_id: String,
    pub tts_output_json: PathBuf,
    pub qa_report_json: PathBuf,
    pub run_manifest_json: PathBuf,
    pub segment_audio_dir: PathBuf,
    pub preview: PreviewSummary,
    pub qa_report: QualityReport,
    pub qa_gate: GateDecision,
    pub postfit: PostfitSummary,
    pub timings: StageTimings,
}

fn sha256_bytes_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[must_use]
pub fn preview_file_name(language: &str) -> String {
    format!("tts_preview_stitched.{language}.wav")
}

fn segment_wav_path(segment_dir: &Path, id: u32) -> PathBuf {
    segment_dir.join(format!("seg_{id:06}.wav"))
}

/// Turn upstream translation output into a `tts_input` document on disk.
pub fn prepare_tts_input(
    translation_output_json: &Path,
    output_json: &Path,
    language_override: Option<&str>,
) -> DubResult<TtsInputDocument> {
    let payload = read_json_value(translation_output_json)?;
    let document = TtsInputDocument::from_translation_output(payload, language_override)?;
    write_json(output_json, &document)?;
    tracing::info!(
        segments = document.segment_count,
        words = document.total_target_word_count,
        language = %document.language,
        output = %output_json.display(),
        "tts input prepared"
    );
    Ok(document)
}

/// Run with the synthesizer described by `config.tts`.
pub fn run_dub(
    request: &RunRequest,
    config: &AppConfig,
    token: &CancellationToken,
) -> DubResult<RunArtifacts> {
    let synthesizer = build_synthesizer(&config.tts)?;
    run_dub_with_synthesizer(request, config, synthesizer.as_ref(), token)
}

/// Run with an explicit synthesizer. Segments are processed in input order;
/// any segment failure aborts the run. When the strict gate blocks, every
/// artifact is already on disk before `QualityGateFailure` is returned.
pub fn run_dub_with_synthesizer(
    request: &RunRequest,
    config: &AppConfig,
    synthesizer: &dyn Synthesizer,
    token: &CancellationToken,
) -> DubResult<RunArtifacts> {
    let pipeline_start = Instant::now();
    let started_at = Utc::now().to_rfc3339();
    let run_id = Uuid::new_v4().to_string();
    let mut log = EventLog::new();
    let mut timings = StageTimings::default();
    log.push(
        "run",
        "run.start",
        "dubbing run started",
        json!({"run_id": run_id, "backend": synthesizer.name()}),
    );
    tracing::info!(
        run_id = %run_id,
        backend = synthesizer.name(),
        input = %request.tts_input_json.display(),
        "dubbing run started"
    );

    let read_start = Instant::now();
    if !request.tts_input_json.is_file() {
        return Err(DubError::InputNotFound(request.tts_input_json.clone()));
    }
    let input_bytes = fs::read(&request.tts_input_json)?;
    let input_sha256 = sha256_bytes_hex(&input_bytes);
    let input = TtsInputDocument::from_json_bytes(&input_bytes)?;
    timings.read_input = read_start.elapsed().as_secs_f64();
    log.push(
        "read_input",
        "input.parsed",
        "tts input parsed",
        json!({"segment_count": input.segments.len(), "language": input.language, "sha256": input_sha256}),
    );

    let segment_dir = request.output_dir.join(SEGMENT_DIR);
    fs::create_dir_all(&segment_dir)?;
    let corrector = PostfitCorrector::from_config(config);

    let synth_start = Instant::now();
    let mut results = Vec::with_capacity(input.segments.len());
    let mut outcomes = Vec::with_capacity(input.segments.len());
    let mut postfit = PostfitSummary::default();
    for segment in &input.segments {
        token.checkpoint()?;
        let output_wav = segment_wav_path(&segment_dir, segment.id);
        let target_duration = segment.target_duration();
        let output = synthesizer.synthesize(
            &SynthesisRequest {
                text: &segment.target_text,
                target_duration,
                sample_rate: config.tts.sample_rate,
                output_wav: &output_wav,
            },
            token,
        )?;
        let outcome = corrector.apply(segment.id, &output_wav, target_duration)?;
        postfit.record(&outcome);
        if outcome.action != PostfitAction::None {
            log.push(
                "postfit",
                "segment.corrected",
                "segment duration corrected",
                json!({
                    "segment_id": segment.id,
                    "action": outcome.action,
                    "adjusted_seconds": outcome.adjusted_seconds,
                }),
            );
        }
        results.push(SynthesisResult {
            segment_id: segment.id,
            audio_path: output_wav,
            produced_duration: output.produced_duration,
            duration_delta: output.produced_duration - target_duration,
            attempts: output.attempts,
            final_speed_wpm: output.final_speed_wpm,
        });
        outcomes.push(outcome);
    }
    timings.synthesize_segments = synth_start.elapsed().as_secs_f64();
    log.push(
        "synthesize",
        "segments.done",
        "all segments synthesized",
        json!({
            "segment_count": results.len(),
            "attempts": results.iter().map(|r| u64::from(r.attempts)).sum::<u64>(),
            "postfit": postfit,
        }),
    );

    let build_start = Instant::now();
    let output_doc = TtsOutputDocument::build(
        &input,
        synthesizer.name(),
        config.tts.sample_rate,
        &results,
        &outcomes,
    )?;
    timings.build_output_contract = build_start.elapsed().as_secs_f64();

    let qa_start = Instant::now();
    let qa_report = build_quality_report(&output_doc, &config.qa, &postfit);
    timings.build_qa_report = qa_start.elapsed().as_secs_f64();
    log.push(
        "qa",
        "qa.report",
        "quality report built",
        json!({"quality_flags": qa_report.quality_flags}),
    );

    let write_start = Instant::now();
    let tts_output_json = request.output_dir.join(TTS_OUTPUT_FILE);
    let qa_report_json = request.output_dir.join(QA_REPORT_FILE);
    write_json(&tts_output_json, &output_doc)?;
    write_json(&qa_report_json, &qa_report)?;
    let placed: Vec<(f64, PathBuf)> = output_doc
        .segments
        .iter()
        .map(|segment| (segment.start, PathBuf::from(&segment.audio_path)))
        .collect();
    let preview = stitch_preview(
        &placed,
        &request.output_dir.join(preview_file_name(&output_doc.language)),
        config.tts.sample_rate,
    )?;
    timings.write_outputs = write_start.elapsed().as_secs_f64();

    let qa_gate = evaluate_gate(&qa_report, &config.qa);
    log.push(
        "qa",
        "qa.gate",
        if qa_gate.passed {
            "quality gate passed"
        } else {
            "quality gate found blocked flags"
        },
        json!({"enabled": qa_gate.enabled, "blocked_flags": qa_gate.blocked_flags}),
    );
    timings.total_pipeline = pipeline_start.elapsed().as_secs_f64();

    let run_manifest_json = request.output_dir.join(RUN_MANIFEST_FILE);
    let manifest = RunManifest {
        run_id: run_id.clone(),
        stage: QA_STAGE.to_owned(),
        backend: synthesizer.name().to_owned(),
        started_at_rfc3339: started_at,
        finished_at_rfc3339: Utc::now().to_rfc3339(),
        inputs: ManifestInputs {
            tts_input_json: request.tts_input_json.display().to_string(),
            tts_input_sha256: input_sha256,
        },
        outputs: ManifestOutputs {
            tts_output_json: tts_output_json.display().to_string(),
            qa_report_json: qa_report_json.display().to_string(),
            segment_audio_dir: segment_dir.display().to_string(),
            stitched_preview_wav: preview.path.display().to_string(),
        },
        timings_seconds: timings.clone(),
        postfit,
        qa_gate: qa_gate.clone(),
        events: log.events,
    };
    write_json(&run_manifest_json, &manifest)?;

    if let Err(err) = qa_gate.enforce() {
        tracing::error!(
            run_id = %run_id,
            blocked_flags = ?qa_gate.blocked_flags,
            "strict quality gate failed"
        );
        return Err(err);
    }
    tracing::info!(
        run_id = %run_id,
        segments = output_doc.segment_count,
        flags = qa_report.quality_flags.len(),
        total_seconds = timings.total_pipeline,
        "dubbing run finished"
    );

    Ok(RunArtifacts {
        run_id,
        tts_output_json,
        qa_report_json,
        run_manifest_json,
        segment_audio_dir: segment_dir,
        preview,
        qa_report,
        qa_gate,
        postfit,
        timings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunManifest;

    fn write_input(dir: &Path, segments: Value) -> PathBuf {
        let path = dir.join("tts_input.json");
        write_json(
            &path,
            &json!({"stage": "tts_input", "language": "tr", "segments": segments}),
        )
        .expect("write input");
        path
    }

    fn tone_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.tts.sample_rate = 8_000;
        config
    }

    #[test]
    fn token_cancel_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.checkpoint(), Err(DubError::Cancelled(_))));
    }

    #[test]
    fn expired_deadline_cancels() {
        let token = CancellationToken::with_deadline_from_now(std::time::Duration::ZERO);
        assert!(token.is_cancelled());
        let generous = CancellationToken::with_deadline_from_now(std::time::Duration::from_secs(600));
        assert!(!generous.is_cancelled());
    }

    #[test]
    fn tone_run_writes_every_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(
            dir.path(),
            json!([
                {"id": 0, "start": 0.0, "end": 0.5, "target_text": "merhaba"},
                {"id": 1, "start": 0.5, "end": 1.25, "target_text": "dunya"}
            ]),
        );
        let request = RunRequest {
            tts_input_json: input,
            output_dir: dir.path().join("out"),
        };
        let artifacts =
            run_dub(&request, &tone_config(), &CancellationToken::new()).expect("run");

        assert!(artifacts.tts_output_json.is_file());
        assert!(artifacts.qa_report_json.is_file());
        assert!(artifacts.run_manifest_json.is_file());
        assert!(artifacts.preview.path.is_file());
        assert!(artifacts.segment_audio_dir.join("seg_000001.wav").is_file());
        assert!(artifacts.qa_report.quality_flags.is_empty());
        assert!((artifacts.preview.duration_seconds - 1.25).abs() < 1e-3);

        let manifest: RunManifest = serde_json::from_slice(
            &fs::read(&artifacts.run_manifest_json).expect("read manifest"),
        )
        .expect("parse manifest");
        assert_eq!(manifest.run_id, artifacts.run_id);
        assert_eq!(manifest.inputs.tts_input_sha256.len(), 64);
        assert!(manifest.qa_gate.passed);
        assert!(manifest.events.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        assert_eq!(manifest.events[0].code, "run.start");
    }

    #[test]
    fn missing_input_is_input_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = RunRequest {
            tts_input_json: dir.path().join("absent.json"),
            output_dir: dir.path().join("out"),
        };
        let err = run_dub(&request, &tone_config(), &CancellationToken::new())
            .expect_err("missing input");
        assert_eq!(err.exit_code(), 14);
    }

    #[test]
    fn cancelled_token_stops_before_first_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(
            dir.path(),
            json!([{"id": 0, "start": 0.0, "end": 0.5, "target_text": "a"}]),
        );
        let token = CancellationToken::new();
        token.cancel();
        let err = run_dub(
            &RunRequest {
                tts_input_json: input,
                output_dir: dir.path().join("out"),
            },
            &tone_config(),
            &token,
        )
        .expect_err("cancelled");
        assert!(matches!(err, DubError::Cancelled(_)));
        assert!(!dir.path().join("out").join(RUN_MANIFEST_FILE).exists());
    }

    #[test]
    fn prepare_converts_translation_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let upstream = dir.path().join("translation_output.json");
        write_json(
            &upstream,
            &json!({
                "stage": "translation_output",
                "target_language": "tr",
                "segments": [
                    {"id": 0, "start": 0.0, "end": 1.5, "target_text": "iyi gunler efendim"},
                    {"id": 1, "start": 1.5, "end": 2.0, "target_text": "tamam"}
                ]
            }),
        )
        .expect("write upstream");
        let output = dir.path().join("tts").join("tts_input.de.json");
        let document = prepare_tts_input(&upstream, &output, Some("de")).expect("prepare");
        assert_eq!(document.language, "de");
        assert_eq!(document.total_target_word_count, 4);
        let reread = TtsInputDocument::from_json_bytes(&fs::read(&output).expect("read"))
            .expect("parse");
        assert_eq!(reread.segments.len(), 2);
        assert!((reread.segments[0].duration - 1.5).abs() < 1e-9);
    }

    #[test]
    fn preview_name_carries_language() {
        assert_eq!(preview_file_name("tr"), "tts_preview_stitched.tr.wav");
        assert_eq!(
            segment_wav_path(Path::new("segs"), 42),
            PathBuf::from("segs/seg_000042.wav")
        );
    }
}
