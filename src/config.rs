//! TOML configuration: built-in defaults, deep-merged override file, eager
//! validation.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DubError, DubResult};
use crate::qa::QualityFlag;

pub const MAX_ADAPTIVE_PASSES: u32 = 8;
pub const MAX_PITCH: u32 = 99;
pub const MAX_TONE_HZ: u32 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[serde(alias = "mock")]
    Tone,
    Piper,
    Espeak,
}

impl BackendKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tone => "tone",
            Self::Piper => "piper",
            Self::Espeak => "espeak",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToneConfig {
    pub base_tone_hz: u32,
    pub amplitude: u32,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            base_tone_hz: 220,
            amplitude: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EspeakConfig {
    pub bin: String,
    pub voice: String,
    pub speed_wpm: u32,
    pub pitch: u32,
    pub adaptive_rate_enabled: bool,
    pub adaptive_min_wpm: u32,
    pub adaptive_max_wpm: u32,
    pub adaptive_max_passes: u32,
    pub adaptive_tolerance_seconds: f64,
}

impl Default for EspeakConfig {
    fn default() -> Self {
        Self {
            bin: "espeak".to_owned(),
            voice: "tr".to_owned(),
            speed_wpm: 165,
            pitch: 50,
            adaptive_rate_enabled: true,
            adaptive_min_wpm: 120,
            adaptive_max_wpm: 260,
            adaptive_max_passes: 3,
            adaptive_tolerance_seconds: 0.08,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PiperConfig {
    pub bin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<u32>,
    pub length_scale: f64,
    pub noise_scale: f64,
    pub noise_w: f64,
}

impl Default for PiperConfig {
    fn default() -> Self {
        Self {
            bin: "piper".to_owned(),
            model_path: None,
            config_path: None,
            speaker: None,
            length_scale: 1.0,
            noise_scale: 0.667,
            noise_w: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TtsConfig {
    pub backend: BackendKind,
    pub sample_rate: u32,
    pub min_segment_seconds: f64,
    /// Per-invocation limit for external synthesizers. Zero disables it.
    pub command_timeout_seconds: f64,
    pub tone: ToneConfig,
    pub espeak: EspeakConfig,
    pub piper: PiperConfig,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Tone,
            sample_rate: 24_000,
            min_segment_seconds: 0.12,
            command_timeout_seconds: 120.0,
            tone: ToneConfig::default(),
            espeak: EspeakConfig::default(),
            piper: PiperConfig::default(),
        }
    }
}

impl TtsConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.command_timeout_seconds)
            .ok()
            .filter(|timeout| !timeout.is_zero())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostfitConfig {
    pub enabled: bool,
}

impl Default for PostfitConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QaConfig {
    /// Duration tolerance for QA, also the slack postfit allows before trimming.
    pub max_duration_delta_seconds: f64,
    pub max_postfit_segment_ratio: f64,
    pub max_postfit_seconds_ratio: f64,
    pub fail_on_flags: bool,
    pub allowed_flags: Vec<QualityFlag>,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            max_duration_delta_seconds: 0.12,
            max_postfit_segment_ratio: 0.35,
            max_postfit_seconds_ratio: 0.20,
            fail_on_flags: false,
            allowed_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub tts: TtsConfig,
    pub postfit: PostfitConfig,
    pub qa: QaConfig,
}

impl AppConfig {
    /// Built-in defaults with the optional override file deep-merged on top.
    pub fn load(path: Option<&Path>) -> DubResult<Self> {
        let toml::Value::Table(mut merged) = toml::Value::try_from(Self::default())? else {
            return Err(DubError::InvalidConfig(
                "default configuration did not render as a table".to_owned(),
            ));
        };
        if let Some(path) = path {
            if !path.is_file() {
                return Err(DubError::InputNotFound(path.to_path_buf()));
            }
            let text = fs::read_to_string(path)?;
            let overrides: toml::Table = toml::from_str(&text)?;
            deep_merge(&mut merged, overrides);
        }
        let config: Self = toml::Value::Table(merged).try_into()?;
        config.validate()?;
        tracing::debug!(
            backend = %config.tts.backend,
            source = ?path,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn to_toml_string(&self) -> DubResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn write_toml(&self, path: &Path) -> DubResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn validate(&self) -> DubResult<()> {
        let tts = &self.tts;
        ensure(tts.sample_rate > 0, "tts.sample_rate must be > 0")?;
        ensure_finite_at_least(tts.min_segment_seconds, 0.0, "tts.min_segment_seconds")?;
        ensure_finite_at_least(tts.command_timeout_seconds, 0.0, "tts.command_timeout_seconds")?;
        ensure(
            Duration::try_from_secs_f64(tts.command_timeout_seconds).is_ok(),
            "tts.command_timeout_seconds is too large",
        )?;

        ensure(
            (1..=MAX_TONE_HZ).contains(&tts.tone.base_tone_hz),
            "tts.tone.base_tone_hz must be within 1..=20000",
        )?;
        ensure(
            (1..=i16::MAX as u32).contains(&tts.tone.amplitude),
            "tts.tone.amplitude must be within 1..=32767",
        )?;

        let espeak = &tts.espeak;
        ensure(!espeak.voice.trim().is_empty(), "tts.espeak.voice must be non-empty")?;
        ensure(espeak.speed_wpm > 0, "tts.espeak.speed_wpm must be > 0")?;
        ensure(
            espeak.pitch <= MAX_PITCH,
            "tts.espeak.pitch must be within 0..=99",
        )?;
        ensure(espeak.adaptive_min_wpm > 0, "tts.espeak.adaptive_min_wpm must be > 0")?;
        ensure(
            espeak.adaptive_max_wpm >= espeak.adaptive_min_wpm,
            "tts.espeak.adaptive_max_wpm must be >= tts.espeak.adaptive_min_wpm",
        )?;
        ensure(
            espeak.adaptive_max_passes <= MAX_ADAPTIVE_PASSES,
            "tts.espeak.adaptive_max_passes must be within 0..=8",
        )?;
        ensure(
            espeak.adaptive_tolerance_seconds.is_finite() && espeak.adaptive_tolerance_seconds > 0.0,
            "tts.espeak.adaptive_tolerance_seconds must be > 0",
        )?;
        if tts.backend == BackendKind::Espeak {
            ensure(!espeak.bin.trim().is_empty(), "tts.espeak.bin must be non-empty")?;
        }

        let piper = &tts.piper;
        for (value, field) in [
            (piper.length_scale, "tts.piper.length_scale"),
            (piper.noise_scale, "tts.piper.noise_scale"),
            (piper.noise_w, "tts.piper.noise_w"),
        ] {
            ensure(value.is_finite() && value > 0.0, &format!("{field} must be > 0"))?;
        }
        if tts.backend == BackendKind::Piper {
            ensure(!piper.bin.trim().is_empty(), "tts.piper.bin must be non-empty")?;
            ensure(
                piper.model_path.is_some(),
                "tts.piper.model_path is required when tts.backend = \"piper\"",
            )?;
        }

        let qa = &self.qa;
        ensure_finite_at_least(
            qa.max_duration_delta_seconds,
            0.0,
            "qa.max_duration_delta_seconds",
        )?;
        for (value, field) in [
            (qa.max_postfit_segment_ratio, "qa.max_postfit_segment_ratio"),
            (qa.max_postfit_seconds_ratio, "qa.max_postfit_seconds_ratio"),
        ] {
            ensure(
                (0.0..=1.0).contains(&value),
                &format!("{field} must be within 0..=1"),
            )?;
        }
        Ok(())
    }
}

fn ensure(condition: bool, message: &str) -> DubResult<()> {
    if condition {
        Ok(())
    } else {
        Err(DubError::InvalidConfig(message.to_owned()))
    }
}

fn ensure_finite_at_least(value: f64, floor: f64, field: &str) -> DubResult<()> {
    ensure(
        value.is_finite() && value >= floor,
        &format!("{field} must be >= {floor}"),
    )
}

/// Tables merge recursively; every other value in `overrides` replaces the base.
fn deep_merge(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("profile.toml");
        fs::write(&path, body).expect("write config");
        path
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::load(None).expect("defaults load");
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.tts.backend, BackendKind::Tone);
        assert!(config.postfit.enabled);
        assert!(!config.qa.fail_on_flags);
    }

    #[test]
    fn override_merges_nested_tables_without_dropping_siblings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            dir.path(),
            "[tts]\nbackend = \"espeak\"\n\n[tts.espeak]\npitch = 61\n",
        );
        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.tts.backend, BackendKind::Espeak);
        assert_eq!(config.tts.espeak.pitch, 61);
        assert_eq!(config.tts.espeak.voice, "tr");
        assert_eq!(config.tts.espeak.adaptive_max_wpm, 260);
        assert_eq!(config.tts.sample_rate, 24_000);
    }

    #[test]
    fn mock_is_an_alias_for_tone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(dir.path(), "[tts]\nbackend = \"mock\"\n");
        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.tts.backend, BackendKind::Tone);
    }

    #[test]
    fn allowed_flags_parse_and_reject_unknown_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            dir.path(),
            "[qa]\nfail_on_flags = true\nallowed_flags = [\"empty_tts_text_present\"]\n",
        );
        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.qa.allowed_flags, vec![QualityFlag::EmptyTtsTextPresent]);

        let bad = write_config(dir.path(), "[qa]\nallowed_flags = [\"made_up_flag\"]\n");
        let err = AppConfig::load(Some(&bad)).expect_err("unknown flag");
        assert_eq!(err.exit_code(), 15);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(dir.path(), "[tts]\nspeed = 3\n");
        let err = AppConfig::load(Some(&path)).expect_err("unknown key");
        assert!(matches!(err, DubError::TomlDe(_)), "{err:?}");
    }

    #[test]
    fn missing_override_file_is_input_not_found() {
        let err = AppConfig::load(Some(Path::new("/definitely/not/here.toml")))
            .expect_err("missing file");
        assert!(matches!(err, DubError::InputNotFound(_)));
    }

    #[test]
    fn numeric_ranges_are_enforced() {
        let cases: Vec<(&str, Box<dyn Fn(&mut AppConfig)>)> = vec![
            ("sample_rate", Box::new(|c| c.tts.sample_rate = 0)),
            ("pitch", Box::new(|c| c.tts.espeak.pitch = 100)),
            ("passes", Box::new(|c| c.tts.espeak.adaptive_max_passes = 9)),
            (
                "bounds",
                Box::new(|c| {
                    c.tts.espeak.adaptive_min_wpm = 200;
                    c.tts.espeak.adaptive_max_wpm = 150;
                }),
            ),
            (
                "tolerance",
                Box::new(|c| c.tts.espeak.adaptive_tolerance_seconds = 0.0),
            ),
            ("amplitude", Box::new(|c| c.tts.tone.amplitude = 40_000)),
            ("ratio", Box::new(|c| c.qa.max_postfit_segment_ratio = 1.5)),
            ("delta", Box::new(|c| c.qa.max_duration_delta_seconds = -0.1)),
            ("noise", Box::new(|c| c.tts.piper.noise_w = 0.0)),
            ("min_segment", Box::new(|c| c.tts.min_segment_seconds = f64::NAN)),
            ("tone_hz", Box::new(|c| c.tts.tone.base_tone_hz = u32::MAX)),
        ];
        for (label, mutate) in cases {
            let mut config = AppConfig::default();
            mutate(&mut config);
            let err = config.validate().expect_err(label);
            assert!(matches!(err, DubError::InvalidConfig(_)), "{label}: {err:?}");
        }
    }

    #[test]
    fn oversized_command_timeout_is_rejected_at_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            dir.path(),
            "[tts]\nbackend = \"espeak\"\ncommand_timeout_seconds = 1e30\n",
        );
        let err = AppConfig::load(Some(&path)).expect_err("timeout too large");
        assert_eq!(err.exit_code(), 15);
        assert!(err.to_string().contains("command_timeout_seconds"), "{err}");

        let mut tts = TtsConfig::default();
        tts.command_timeout_seconds = 1e30;
        assert_eq!(tts.command_timeout(), None);
        tts.command_timeout_seconds = 0.0;
        assert_eq!(tts.command_timeout(), None);
        tts.command_timeout_seconds = 2.5;
        assert_eq!(tts.command_timeout(), Some(Duration::from_millis(2_500)));
    }

    #[test]
    fn piper_requires_model_path_at_load_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(dir.path(), "[tts]\nbackend = \"piper\"\n");
        let err = AppConfig::load(Some(&path)).expect_err("missing model");
        assert!(err.to_string().contains("model_path"), "{err}");

        let ok = write_config(
            dir.path(),
            "[tts]\nbackend = \"piper\"\n\n[tts.piper]\nmodel_path = \"voices/tr.onnx\"\n",
        );
        let config = AppConfig::load(Some(&ok)).expect("load");
        assert_eq!(
            config.tts.piper.model_path.as_deref(),
            Some(Path::new("voices/tr.onnx"))
        );
    }

    #[test]
    fn written_config_reloads_identically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        config.tts.backend = BackendKind::Espeak;
        config.tts.espeak.speed_wpm = 175;
        config.tts.espeak.adaptive_tolerance_seconds = 0.06;
        config.qa.allowed_flags = vec![QualityFlag::DurationOutOfTolerancePresent];
        let path = dir.path().join("nested").join("candidate.toml");
        config.write_toml(&path).expect("write");
        let reloaded = AppConfig::load(Some(&path)).expect("reload");
        assert_eq!(reloaded, config);
    }

    #[test]
    fn zero_timeout_disables_the_limit() {
        let mut tts = TtsConfig::default();
        assert_eq!(tts.command_timeout(), Some(Duration::from_secs(120)));
        tts.command_timeout_seconds = 0.0;
        assert_eq!(tts.command_timeout(), None);
    }
}
