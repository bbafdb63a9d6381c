//! Settings storage
//!
//! The engine configuration lives in one pretty-printed JSON file. A missing
//! file is replaced with defaults on first load; fields absent from an older
//! file fall back to their defaults.

use crate::error::{BridgeError, BridgeResult};
use astrocam_sequencer::{EngineConfig, MAX_DURATION_SECS};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE_NAME: &str = "settings.json";

pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    /// Use `storage_dir/settings.json`, creating the directory if needed.
    pub fn new(storage_dir: impl Into<PathBuf>) -> BridgeResult<Self> {
        let storage_dir = storage_dir.into();
        std::fs::create_dir_all(&storage_dir).map_err(|e| {
            BridgeError::settings(storage_dir.display().to_string(), e.to_string())
        })?;
        Ok(Self {
            path: storage_dir.join(SETTINGS_FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, writing defaults first when no file exists.
    pub fn load(&self) -> BridgeResult<EngineConfig> {
        if !self.path.exists() {
            tracing::info!(
                "No settings at {}, writing defaults",
                self.path.display()
            );
            let config = EngineConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| BridgeError::settings(self.shown(), e.to_string()))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| BridgeError::settings(self.shown(), e.to_string()))?;
        validate(&config)?;
        tracing::info!("Loaded settings from {}", self.path.display());
        Ok(config)
    }

    /// Write the configuration through a temporary file and rename it into
    /// place, so a crash never leaves a half-written settings file.
    pub fn save(&self, config: &EngineConfig) -> BridgeResult<()> {
        validate(config)?;
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| BridgeError::settings(self.shown(), e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| BridgeError::settings(self.shown(), e.to_string()))?;
        tracing::debug!("Saved settings to {}", self.path.display());
        Ok(())
    }

    fn shown(&self) -> String {
        self.path.display().to_string()
    }
}

/// A duration in seconds must be finite and within `min..=MAX_DURATION_SECS`.
fn check_secs(name: &str, value: f64, allow_zero: bool) -> BridgeResult<()> {
    let low_ok = if allow_zero { value >= 0.0 } else { value > 0.0 };
    if value.is_finite() && low_ok && value <= MAX_DURATION_SECS {
        return Ok(());
    }
    Err(BridgeError::InvalidSettings(format!(
        "{} must be within {}..{}s, got {}",
        name,
        if allow_zero { "0" } else { ">0" },
        MAX_DURATION_SECS,
        value
    )))
}

/// Reject values the engine cannot run with.
pub fn validate(config: &EngineConfig) -> BridgeResult<()> {
    let capture = &config.capture;
    check_secs("exposure duration", capture.exposure.duration_secs, false)?;
    check_secs("live maximum exposure", capture.live_max_exposure_secs, false)?;
    check_secs("exposure timeout margin", capture.exposure_timeout_margin_secs, true)?;
    let solve = &config.plate_solve;
    check_secs("solve timeout", solve.solve_timeout_secs, false)?;
    check_secs("solution staleness", solve.staleness_secs, true)?;
    check_secs("hint maximum age", solve.hint_max_age_secs, true)?;
    if !config.capture.interval_plan.entries.is_empty() {
        config.capture.interval_plan.validate()?;
    }
    let guide = &config.guide;
    if guide.dead_band_px < 0.0 || guide.gain_ms_per_px < 0.0 || guide.integral_gain < 0.0 {
        return Err(BridgeError::InvalidSettings(
            "guide gains and dead band must not be negative".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&guide.integral_decay) {
        return Err(BridgeError::InvalidSettings(format!(
            "guide integral decay must be within 0..1, got {}",
            guide.integral_decay
        )));
    }
    if config.display.width == 0 || config.display.height == 0 {
        return Err(BridgeError::InvalidSettings(
            "display size must be non-zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SettingsStorage::new(dir.path().join("cfg")).unwrap();
        let config = storage.load().unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(storage.path().exists());
    }

    #[test]
    fn test_save_then_load_keeps_changes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SettingsStorage::new(dir.path()).unwrap();
        let mut config = EngineConfig::default();
        config.capture.exposure.duration_secs = 120.0;
        config.capture.repeat_limit = Some(25);
        config.guide.enabled = true;
        storage.save(&config).unwrap();
        assert_eq!(storage.load().unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SettingsStorage::new(dir.path()).unwrap();
        std::fs::write(storage.path(), r#"{ "guide": { "enabled": true } }"#).unwrap();
        let config = storage.load().unwrap();
        assert!(config.guide.enabled);
        assert_eq!(config.capture, EngineConfig::default().capture);
    }

    #[test]
    fn test_corrupt_file_is_a_settings_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SettingsStorage::new(dir.path()).unwrap();
        std::fs::write(storage.path(), "{ not json").unwrap();
        assert!(storage.load().unwrap_err().is_settings_error());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = EngineConfig::default();
        config.guide.integral_decay = 1.5;
        assert!(matches!(
            validate(&config),
            Err(BridgeError::InvalidSettings(_))
        ));

        let mut config = EngineConfig::default();
        config.capture.exposure.duration_secs = 0.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_huge_or_non_finite_durations_are_rejected() {
        let mut config = EngineConfig::default();
        config.capture.exposure.duration_secs = 1e20;
        assert!(validate(&config).is_err());

        let mut config = EngineConfig::default();
        config.capture.exposure_timeout_margin_secs = f64::INFINITY;
        assert!(validate(&config).is_err());

        let mut config = EngineConfig::default();
        config.plate_solve.staleness_secs = 1e300;
        assert!(validate(&config).is_err());

        let mut config = EngineConfig::default();
        config.plate_solve.hint_max_age_secs = f64::NAN;
        assert!(validate(&config).is_err());

        let mut config = EngineConfig::default();
        config.plate_solve.solve_timeout_secs = -1.0;
        assert!(validate(&config).is_err());

        let mut config = EngineConfig::default();
        config.capture.exposure_timeout_margin_secs = 0.0;
        assert!(validate(&config).is_ok());
    }
}
