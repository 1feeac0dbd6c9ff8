use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::backend::adaptive::{AdaptiveRateController, AdaptiveSettings};
use crate::backend::{SynthesisOutput, SynthesisRequest, Synthesizer, missing_output, placeholder_text};
use crate::config::{BackendKind, TtsConfig};
use crate::error::DubResult;
use crate::pipeline::CancellationToken;
use crate::process::{command_exists, run_command_cancellable};
use crate::wav;

const ESPEAK: &str = "espeak";
const ESPEAK_NG: &str = "espeak-ng";

/// eSpeak driven through the adaptive rate controller.
///
/// eSpeak always renders at its own native rate (22050 Hz); the requested
/// sample rate is not forwarded.
#[derive(Debug, Clone)]
pub struct EspeakSynthesizer {
    configured_bin: String,
    bin: String,
    voice: String,
    pitch: u32,
    adaptive: AdaptiveSettings,
    timeout: Option<Duration>,
}

/// First resolvable binary among the configured one and its sibling
/// (`espeak` and `espeak-ng` stand in for each other). Falls back to the
/// configured name so the eventual error names what the user asked for.
#[must_use]
pub fn resolve_espeak_bin(configured: &str) -> String {
    let configured = match configured.trim() {
        "" => ESPEAK,
        value => value,
    };
    let sibling = match configured.to_ascii_lowercase().as_str() {
        ESPEAK => Some(ESPEAK_NG),
        ESPEAK_NG => Some(ESPEAK),
        _ => None,
    };
    std::iter::once(configured)
        .chain(sibling)
        .find(|candidate| command_exists(candidate))
        .unwrap_or(configured)
        .to_owned()
}

pub(crate) fn build_args(
    voice: &str,
    speed_wpm: u32,
    pitch: u32,
    output_wav: &Path,
    text: &str,
) -> Vec<String> {
    vec![
        "-v".to_owned(),
        voice.to_owned(),
        "-s".to_owned(),
        speed_wpm.to_string(),
        "-p".to_owned(),
        pitch.to_string(),
        "-w".to_owned(),
        output_wav.display().to_string(),
        text.to_owned(),
    ]
}

impl EspeakSynthesizer {
    #[must_use]
    pub fn from_config(tts: &TtsConfig) -> Self {
        let espeak = &tts.espeak;
        Self {
            configured_bin: espeak.bin.clone(),
            bin: resolve_espeak_bin(&espeak.bin),
            voice: espeak.voice.clone(),
            pitch: espeak.pitch,
            adaptive: AdaptiveSettings {
                enabled: espeak.adaptive_rate_enabled,
                start_wpm: espeak.speed_wpm,
                min_wpm: espeak.adaptive_min_wpm,
                max_wpm: espeak.adaptive_max_wpm,
                max_passes: espeak.adaptive_max_passes,
                tolerance_seconds: espeak.adaptive_tolerance_seconds,
            },
            timeout: tts.command_timeout(),
        }
    }

    fn synthesize_once(
        &self,
        text: &str,
        speed_wpm: u32,
        output_wav: &Path,
        token: &CancellationToken,
    ) -> DubResult<f64> {
        let args = build_args(&self.voice, speed_wpm, self.pitch, output_wav, text);
        if output_wav.exists() {
            fs::remove_file(output_wav)?;
        }
        run_command_cancellable(&self.bin, &args, None, None, token, self.timeout)?;
        if !output_wav.is_file() {
            return Err(missing_output(&self.bin, output_wav));
        }
        wav::duration_seconds(output_wav)
    }
}

impl Synthesizer for EspeakSynthesizer {
    fn name(&self) -> &'static str {
        ESPEAK
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Espeak
    }

    fn preflight(&self) -> Vec<String> {
        if command_exists(&self.bin) {
            return Vec::new();
        }
        vec![format!(
            "espeak binary `{}` not found on PATH (espeak and espeak-ng were both tried)",
            self.configured_bin
        )]
    }

    fn synthesize(
        &self,
        request: &SynthesisRequest<'_>,
        token: &CancellationToken,
    ) -> DubResult<SynthesisOutput> {
        let text = placeholder_text(request.text);
        if let Some(parent) = request.output_wav.parent() {
            fs::create_dir_all(parent)?;
        }
        let controller = AdaptiveRateController::new(self.adaptive);
        let outcome = controller.run(request.target_duration, |speed_wpm| {
            self.synthesize_once(text, speed_wpm, request.output_wav, token)
        })?;
        Ok(SynthesisOutput {
            produced_duration: outcome.produced_duration,
            attempts: outcome.attempts,
            final_speed_wpm: Some(outcome.final_speed_wpm),
        })
    }
}
