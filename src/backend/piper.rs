use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{SynthesisOutput, SynthesisRequest, Synthesizer, missing_output, placeholder_text};
use crate::config::{BackendKind, TtsConfig};
use crate::error::{DubError, DubResult};
use crate::pipeline::CancellationToken;
use crate::process::{command_exists, run_command_cancellable};
use crate::wav;

const DEFAULT_PIPER_BIN: &str = "piper";

/// Piper neural TTS, invoked exactly once per segment with the text on stdin.
#[derive(Debug, Clone)]
pub struct PiperSynthesizer {
    bin: String,
    model_path: PathBuf,
    config_path: Option<PathBuf>,
    speaker: Option<u32>,
    length_scale: f64,
    noise_scale: f64,
    noise_w: f64,
    timeout: Option<Duration>,
}

fn resolve_piper_bin(configured: &str) -> String {
    let configured = match configured.trim() {
        "" => DEFAULT_PIPER_BIN,
        value => value,
    };
    if command_exists(configured) || !command_exists(DEFAULT_PIPER_BIN) {
        configured.to_owned()
    } else {
        DEFAULT_PIPER_BIN.to_owned()
    }
}

impl PiperSynthesizer {
    pub fn from_config(tts: &TtsConfig) -> DubResult<Self> {
        let piper = &tts.piper;
        let model_path = piper.model_path.clone().ok_or_else(|| {
            DubError::InvalidConfig(
                "tts.piper.model_path is required when tts.backend = \"piper\"".to_owned(),
            )
        })?;
        Ok(Self {
            bin: resolve_piper_bin(&piper.bin),
            model_path,
            config_path: piper.config_path.clone(),
            speaker: piper.speaker,
            length_scale: piper.length_scale,
            noise_scale: piper.noise_scale,
            noise_w: piper.noise_w,
            timeout: tts.command_timeout(),
        })
    }

    pub(crate) fn build_args(&self, output_wav: &Path) -> Vec<String> {
        let mut args = vec![
            "--model".to_owned(),
            self.model_path.display().to_string(),
            "--output_file".to_owned(),
            output_wav.display().to_string(),
            "--length_scale".to_owned(),
            format!("{:.4}", self.length_scale),
            "--noise_scale".to_owned(),
            format!("{:.4}", self.noise_scale),
            "--noise_w".to_owned(),
            format!("{:.4}", self.noise_w),
        ];
        if let Some(config_path) = &self.config_path {
            args.push("--config".to_owned());
            args.push(config_path.display().to_string());
        }
        if let Some(speaker) = self.speaker {
            args.push("--speaker".to_owned());
            args.push(speaker.to_string());
        }
        args
    }
}

impl Synthesizer for PiperSynthesizer {
    fn name(&self) -> &'static str {
        "piper"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Piper
    }

    fn preflight(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !command_exists(&self.bin) {
            issues.push(format!("piper binary `{}` not found on PATH", self.bin));
        }
        if !self.model_path.is_file() {
            issues.push(format!(
                "piper model `{}` does not exist",
                self.model_path.display()
            ));
        }
        if let Some(config_path) = &self.config_path
            && !config_path.is_file()
        {
            issues.push(format!(
                "piper config `{}` does not exist",
                config_path.display()
            ));
        }
        issues
    }

    fn synthesize(
        &self,
        request: &SynthesisRequest<'_>,
        token: &CancellationToken,
    ) -> DubResult<SynthesisOutput> {
        let text = format!("{}\n", placeholder_text(request.text));
        if let Some(parent) = request.output_wav.parent() {
            fs::create_dir_all(parent)?;
        }
        if request.output_wav.exists() {
            fs::remove_file(request.output_wav)?;
        }
        let args = self.build_args(request.output_wav);
        run_command_cancellable(&self.bin, &args, None, Some(&text), token, self.timeout)?;
        if !request.output_wav.is_file() {
            return Err(missing_output(&self.bin, request.output_wav));
        }
        Ok(SynthesisOutput {
            produced_duration: wav::duration_seconds(request.output_wav)?,
            attempts: 1,
            final_speed_wpm: None,
        })
    }
}
