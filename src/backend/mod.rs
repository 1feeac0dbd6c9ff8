mod adaptive;
mod espeak;
mod piper;
mod tone;

use std::path::Path;

pub use adaptive::{AdaptiveExit, AdaptiveOutcome, AdaptiveRateController, AdaptiveSettings, AdaptiveState};
pub use espeak::EspeakSynthesizer;
pub use piper::PiperSynthesizer;
pub use tone::ToneSynthesizer;

use crate::config::{BackendKind, TtsConfig};
use crate::error::{DubError, DubResult};
use crate::pipeline::CancellationToken;

/// One segment's worth of work for a synthesizer.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisRequest<'a> {
    pub text: &'a str,
    pub target_duration: f64,
    pub sample_rate: u32,
    pub output_wav: &'a Path,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    pub produced_duration: f64,
    /// Process invocations (or in-process renders) spent on this segment.
    pub attempts: u32,
    /// Speed the final clip was rendered at, for rate-controlled backends.
    pub final_speed_wpm: Option<u32>,
}

pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> BackendKind;

    /// Human-readable reasons this backend cannot run right now. Empty when ready.
    fn preflight(&self) -> Vec<String>;

    fn is_available(&self) -> bool {
        self.preflight().is_empty()
    }

    /// Render `request.text` to `request.output_wav`. Blank text is replaced by
    /// a single space so every segment still yields a clip.
    fn synthesize(
        &self,
        request: &SynthesisRequest<'_>,
        token: &CancellationToken,
    ) -> DubResult<SynthesisOutput>;
}

/// Text actually handed to a synthesizer.
#[must_use]
pub fn placeholder_text(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.is_empty() { " " } else { trimmed }
}

pub fn build_synthesizer(tts: &TtsConfig) -> DubResult<Box<dyn Synthesizer>> {
    let synthesizer: Box<dyn Synthesizer> = match tts.backend {
        BackendKind::Tone => Box::new(ToneSynthesizer::from_config(tts)),
        BackendKind::Espeak => Box::new(EspeakSynthesizer::from_config(tts)),
        BackendKind::Piper => Box::new(PiperSynthesizer::from_config(tts)?),
    };
    tracing::debug!(backend = synthesizer.name(), "synthesizer constructed");
    Ok(synthesizer)
}

/// Construct the configured backend and collect its readiness issues.
#[must_use]
pub fn preflight(tts: &TtsConfig) -> Vec<String> {
    match build_synthesizer(tts) {
        Ok(synthesizer) => synthesizer.preflight(),
        Err(err) => vec![err.to_string()],
    }
}

/// The tool exited cleanly but left no clip behind.
fn missing_output(program: &str, output_wav: &Path) -> DubError {
    DubError::from_command_failure(
        program.to_owned(),
        0,
        format!("expected output `{}` was not written", output_wav.display()),
    )
}
