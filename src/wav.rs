//! Mono 16-bit PCM WAV helpers shared by the backends, postfit and mixer.

use std::fs;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::{DubError, DubResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmClip {
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl PcmClip {
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

fn mono_pcm16_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

fn open_reader(path: &Path) -> DubResult<WavReader<std::io::BufReader<fs::File>>> {
    if !path.is_file() {
        return Err(DubError::MissingArtifact(path.to_path_buf()));
    }
    Ok(WavReader::open(path)?)
}

/// Read a clip, refusing anything other than single-channel 16-bit integer PCM.
pub fn read_pcm16_mono(path: &Path) -> DubResult<PcmClip> {
    let mut reader = open_reader(path)?;
    let spec = reader.spec();
    if spec.channels != 1 {
        return Err(DubError::FormatMismatch(format!(
            "{} has {} channels; only mono is supported",
            path.display(),
            spec.channels
        )));
    }
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(DubError::FormatMismatch(format!(
            "{} is {}-bit {:?}; only 16-bit integer PCM is supported",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        )));
    }
    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PcmClip {
        sample_rate: spec.sample_rate,
        samples,
    })
}

pub fn write_pcm16_mono(path: &Path, sample_rate: u32, samples: &[i16]) -> DubResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = WavWriter::create(path, mono_pcm16_spec(sample_rate))?;
    for sample in samples {
        writer.write_sample(*sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Duration from the header alone; the sample data is not decoded.
pub fn duration_seconds(path: &Path) -> DubResult<f64> {
    let reader = open_reader(path)?;
    let sample_rate = reader.spec().sample_rate;
    if sample_rate == 0 {
        return Ok(0.0);
    }
    Ok(f64::from(reader.duration()) / f64::from(sample_rate))
}
