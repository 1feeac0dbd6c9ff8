use std::f64::consts::TAU;

use crate::backend::{SynthesisOutput, SynthesisRequest, Synthesizer};
use crate::config::{BackendKind, TtsConfig};
use crate::error::DubResult;
use crate::pipeline::CancellationToken;
use crate::wav::write_pcm16_mono;

/// Deterministic sine-tone stand-in for a real voice.
///
/// The clip is exactly `max(target, min_segment_seconds)` long, and its pitch
/// varies with the text length so neighbouring segments are audibly distinct.
#[derive(Debug, Clone)]
pub struct ToneSynthesizer {
    base_tone_hz: u32,
    amplitude: u32,
    min_segment_seconds: f64,
}

impl ToneSynthesizer {
    #[must_use]
    pub fn from_config(tts: &TtsConfig) -> Self {
        Self {
            base_tone_hz: tts.tone.base_tone_hz,
            amplitude: tts.tone.amplitude,
            min_segment_seconds: tts.min_segment_seconds,
        }
    }

    fn tone_hz(&self, text: &str) -> f64 {
        let offset = (text.chars().count() % 40) as u32;
        f64::from(self.base_tone_hz.saturating_add(offset))
    }

    pub(crate) fn render(&self, text: &str, duration: f64, sample_rate: u32) -> Vec<i16> {
        let frame_count = ((duration * f64::from(sample_rate)).round() as usize).max(1);
        let tone_hz = self.tone_hz(text);
        let amplitude = f64::from(self.amplitude.min(i16::MAX as u32));
        let rate = f64::from(sample_rate);
        (0..frame_count)
            .map(|index| (amplitude * (TAU * tone_hz * index as f64 / rate).sin()) as i16)
            .collect()
    }
}

impl Synthesizer for ToneSynthesizer {
    fn name(&self) -> &'static str {
        "tone"
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
        let duration = request.target_duration.max(self.min_segment_seconds);
        let samples = self.render(request.text, duration, request.sample_rate);
        write_pcm16_mono(request.output_wav, request.sample_rate, &samples)?;
        Ok(SynthesisOutput {
            produced_duration: samples.len() as f64 / f64::from(request.sample_rate),
            attempts: 1,
            final_speed_wpm: None,
        })
    }
}
