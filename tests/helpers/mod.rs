#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use franken_dub::backend::{SynthesisOutput, SynthesisRequest, Synthesizer};
use franken_dub::config::{AppConfig, BackendKind};
use franken_dub::error::{DubError, DubResult};
use franken_dub::model::write_json;
use franken_dub::pipeline::CancellationToken;
use franken_dub::wav::write_pcm16_mono;
use serde_json::{Value, json};

pub const TEST_SAMPLE_RATE: u32 = 8_000;

/// Write a `tts_input` document with the given segments into `dir`.
pub fn write_tts_input(dir: &Path, segments: Value) -> PathBuf {
    let path = dir.join("tts_input.json");
    write_json(
        &path,
        &json!({
            "schema_version": "1.0",
            "stage": "tts_input",
            "language": "tr",
            "segments": segments,
        }),
    )
    .expect("write tts input");
    path
}

/// Segments with one-second targets laid end to end.
pub fn one_second_segments(count: u32) -> Value {
    Value::Array(
        (0..count)
            .map(|id| {
                let start = f64::from(id);
                json!({
                    "id": id,
                    "start": start,
                    "end": start + 1.0,
                    "duration": 1.0,
                    "target_text": format!("segment number {id}"),
                })
            })
            .collect(),
    )
}

/// Tone config at a small sample rate so tests stay fast.
pub fn tone_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.tts.backend = BackendKind::Tone;
    config.tts.sample_rate = TEST_SAMPLE_RATE;
    config
}

pub fn mocks_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("mocks")
}

/// Path to a mock synthesizer script, made executable in place.
#[cfg(unix)]
pub fn mock_script(name: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = mocks_dir().join(name);
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod mock script");
    path
}

pub fn write_config(dir: &Path, file_name: &str, body: &str) -> PathBuf {
    let path = dir.join(file_name);
    fs::write(&path, body).expect("write config");
    path
}

/// Always renders a clip of `seconds`, whatever the target.
pub struct FixedLengthSynth {
    pub seconds: f64,
    pub calls: AtomicU32,
}

impl FixedLengthSynth {
    pub fn new(seconds: f64) -> Self {
        Self {
            seconds,
            calls: AtomicU32::new(0),
        }
    }
}

impl Synthesizer for FixedLengthSynth {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Tone
    }

    fn preflight(&self) -> Vec<String> {
        Vec::new()
    }

    fn synthesize(
        &self,
        request: &SynthesisRequest<'_>,
        token: &CancellationToken,
    ) -> DubResult<SynthesisOutput> {
        token.checkpoint()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let frames = (self.seconds * f64::from(request.sample_rate)).round() as usize;
        write_pcm16_mono(request.output_wav, request.sample_rate, &vec![1_000; frames])?;
        Ok(SynthesisOutput {
            produced_duration: frames as f64 / f64::from(request.sample_rate),
            attempts: 1,
            final_speed_wpm: None,
        })
    }
}

/// Fails on the segment whose text contains `poison`.
pub struct FailingSynth {
    pub poison: &'static str,
}

impl Synthesizer for FailingSynth {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Tone
    }

    fn preflight(&self) -> Vec<String> {
        Vec::new()
    }

    fn synthesize(
        &self,
        request: &SynthesisRequest<'_>,
        _token: &CancellationToken,
    ) -> DubResult<SynthesisOutput> {
        if request.text.contains(self.poison) {
            return Err(DubError::from_command_failure(
                "fake-tts".to_owned(),
                2,
                "voice not installed".to_owned(),
            ));
        }
        write_pcm16_mono(request.output_wav, request.sample_rate, &[0; 8])?;
        Ok(SynthesisOutput {
            produced_duration: 8.0 / f64::from(request.sample_rate),
            attempts: 1,
            final_speed_wpm: None,
        })
    }
}
