//! Full-timeline preview: every segment clip is summed into one buffer at its
//! start offset.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DubError, DubResult};
use crate::wav::{PcmClip, read_pcm16_mono, write_pcm16_mono};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewSummary {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub sample_count: usize,
    pub duration_seconds: f64,
    /// Summed samples that fell outside the 16-bit range and were clamped.
    pub clipped_samples: usize,
}

#[must_use]
pub fn start_index(start_seconds: f64, sample_rate: u32) -> usize {
    (start_seconds * f64::from(sample_rate)).round().max(0.0) as usize
}

/// Add `samples` into `buffer` at `offset`, growing the buffer with zeros.
pub fn mix_into(buffer: &mut Vec<i32>, offset: usize, samples: &[i16]) {
    let end = offset + samples.len();
    if end > buffer.len() {
        buffer.resize(end, 0);
    }
    for (slot, sample) in buffer[offset..end].iter_mut().zip(samples) {
        *slot += i32::from(*sample);
    }
}

/// Clamp a mixed buffer to 16-bit PCM, returning the samples and how many clipped.
#[must_use]
pub fn clamp_to_pcm16(buffer: &[i32]) -> (Vec<i16>, usize) {
    let mut clipped = 0;
    let samples = buffer
        .iter()
        .map(|value| {
            let bounded = (*value).clamp(i32::from(i16::MIN), i32::from(i16::MAX));
            if bounded != *value {
                clipped += 1;
            }
            bounded as i16
        })
        .collect();
    (samples, clipped)
}

/// Mix in-memory clips placed at their start times. All clips must share a
/// sample rate; an empty input yields a single silent sample at
/// `fallback_rate`.
pub fn mix_clips(placed: &[(f64, &PcmClip)], fallback_rate: u32) -> DubResult<(PcmClip, usize)> {
    let mut sample_rate: Option<u32> = None;
    let mut buffer: Vec<i32> = Vec::new();
    for (start, clip) in placed {
        match sample_rate {
            None => sample_rate = Some(clip.sample_rate),
            Some(rate) if rate != clip.sample_rate => {
                return Err(DubError::FormatMismatch(format!(
                    "segment clips must share one sample rate for stitching: {rate} Hz vs {} Hz",
                    clip.sample_rate
                )));
            }
            Some(_) => {}
        }
        mix_into(&mut buffer, start_index(*start, clip.sample_rate), &clip.samples);
    }
    if buffer.is_empty() {
        buffer.push(0);
    }
    let (samples, clipped) = clamp_to_pcm16(&buffer);
    Ok((
        PcmClip {
            sample_rate: sample_rate.unwrap_or(fallback_rate),
            samples,
        },
        clipped,
    ))
}

/// Read each `(start, path)` clip, mix, and write the preview to `output`.
pub fn stitch_preview(
    segments: &[(f64, PathBuf)],
    output: &Path,
    fallback_rate: u32,
) -> DubResult<PreviewSummary> {
    let clips = segments
        .iter()
        .map(|(start, path)| -> DubResult<(f64, PcmClip)> {
            Ok((*start, read_pcm16_mono(path)?))
        })
        .collect::<DubResult<Vec<_>>>()?;
    let placed: Vec<(f64, &PcmClip)> = clips.iter().map(|(start, clip)| (*start, clip)).collect();
    let (mixed, clipped_samples) = mix_clips(&placed, fallback_rate)?;
    write_pcm16_mono(output, mixed.sample_rate, &mixed.samples)?;
    if clipped_samples > 0 {
        tracing::warn!(clipped_samples, "preview mix clipped overlapping segments");
    }
    Ok(PreviewSummary {
        path: output.to_path_buf(),
        sample_rate: mixed.sample_rate,
        sample_count: mixed.samples.len(),
        duration_seconds: mixed.duration_seconds(),
        clipped_samples,
    })
}
