use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::executor::RunOptions;
use crate::interlock::EnvironmentBounds;
use crate::measurements::OPEN_CORRECTION_SAMPLES;
use crate::motion::MotionSettings;

const DEFAULT_CONFIG_FILE: &str = "sqc.toml";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub station: StationConfig,
    pub interlock: InterlockConfig,
    pub motion: MotionSettings,
    pub run: RunConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct StationConfig {
    /// Use the simulated rig instead of real instruments
    pub simulate: bool,
    /// Pause between the steps of a recovery ramp
    pub recover_settle_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct InterlockConfig {
    pub bounds: EnvironmentBounds,
    pub backoff_ms: u64,
    pub max_wait_s: f64,
    /// Interval of the background environment monitor
    pub live_poll_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub remeasure_count: usize,
    pub recontact_count: usize,
    pub open_correction_samples: usize,
    /// Directory receiving the measurement files
    pub output_path: PathBuf,
    pub buffer_size: usize,
    /// Rewrite the JSON-lines output as a JSON array after the run
    pub final_format_json: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConsoleConfig {
    pub log_level: String,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            recover_settle_ms: 250,
        }
    }
}

impl Default for InterlockConfig {
    fn default() -> Self {
        Self {
            bounds: EnvironmentBounds::default(),
            backoff_ms: 5_000,
            max_wait_s: 1_800.0,
            live_poll_ms: 1_000,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            remeasure_count: 0,
            recontact_count: 0,
            open_correction_samples: OPEN_CORRECTION_SAMPLES,
            output_path: PathBuf::from("./data"),
            buffer_size: 16,
            final_format_json: false,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl InterlockConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_s)
    }

    pub fn live_poll(&self) -> Duration {
        Duration::from_millis(self.live_poll_ms)
    }
}

impl RunConfig {
    pub fn options(&self) -> RunOptions {
        RunOptions {
            remeasure_count: self.remeasure_count,
            recontact_count: self.recontact_count,
            open_correction_samples: self.open_correction_samples,
        }
    }
}

impl AppConfig {
    /// Rejects settings no run could work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bounds = &self.interlock.bounds;
        if bounds.temperature_min > bounds.temperature_max {
            return Err(ConfigError::Message(format!(
                "interlock temperature window is empty: [{}, {}]",
                bounds.temperature_min, bounds.temperature_max
            )));
        }
        if bounds.humidity_min > bounds.humidity_max {
            return Err(ConfigError::Message(format!(
                "interlock humidity window is empty: [{}, {}]",
                bounds.humidity_min, bounds.humidity_max
            )));
        }
        if !self.interlock.max_wait_s.is_finite() || self.interlock.max_wait_s < 0.0 {
            return Err(ConfigError::Message(
                "interlock.max_wait_s must be a non-negative number".to_string(),
            ));
        }
        if self.interlock.backoff_ms == 0 {
            return Err(ConfigError::Message(
                "interlock.backoff_ms must be positive".to_string(),
            ));
        }

        let motion = &self.motion;
        if motion.approach_steps.is_empty() {
            return Err(ConfigError::Message(
                "motion.approach_steps must not be empty".to_string(),
            ));
        }
        if motion
            .approach_steps
            .windows(2)
            .any(|w| w[1].abs() > w[0].abs())
        {
            return Err(ConfigError::Message(format!(
                "motion.approach_steps must decrease: {:?}",
                motion.approach_steps
            )));
        }
        for (axis, limits) in [
            ("x", motion.limits.x),
            ("y", motion.limits.y),
            ("z", motion.limits.z),
        ] {
            if limits.minimum > limits.maximum {
                return Err(ConfigError::Message(format!(
                    "motion.limits.{axis}: minimum {} above maximum {}",
                    limits.minimum, limits.maximum
                )));
            }
        }
        if motion.move_timeout_s <= 0.0 || motion.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "motion.move_timeout_s and motion.poll_interval_ms must be positive".to_string(),
            ));
        }

        if self.run.open_correction_samples == 0 {
            return Err(ConfigError::Message(
                "run.open_correction_samples must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads defaults, then the config file, then `SQC__*` environment overrides
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(File::from(path));
    } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
        builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
    }

    builder = builder.add_source(
        Environment::with_prefix("SQC")
            .separator("__")
            .try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("sqc.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.run.options(), RunOptions::default());
        assert_eq!(config.interlock.bounds.humidity_max, 50.0);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[station]
simulate = true

[interlock]
backoff_ms = 200
[interlock.bounds]
temperature_min = 18.0
temperature_max = 25.0
humidity_min = 0.0
humidity_max = 40.0

[motion]
recontact_offsets = [0.0, 10.0]

[run]
remeasure_count = 2
recontact_count = 1
output_path = "/tmp/sqc"
"#,
        );
        let config = load_config(Some(&path)).unwrap();
        assert!(config.station.simulate);
        assert_eq!(config.interlock.backoff(), Duration::from_millis(200));
        assert_eq!(config.interlock.bounds.humidity_max, 40.0);
        assert_eq!(config.motion.recontact_offset(1), 10.0);
        assert_eq!(config.motion.approach_steps, vec![20.0, 15.0, 10.0, 5.0]);
        assert_eq!(config.run.options().remeasure_count, 2);
        assert_eq!(config.run.output_path, PathBuf::from("/tmp/sqc"));
        assert_eq!(config.console.log_level, "info");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::Message(_))));
    }

    #[test]
    fn test_validation_rejects_inverted_window() {
        let mut config = AppConfig::default();
        config.interlock.bounds.humidity_min = 60.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.motion.approach_steps = vec![5.0, 20.0];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.run.open_correction_samples = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_file_is_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[interlock.bounds]\nhumidity_min = 60.0\n");
        assert!(load_config(Some(&path)).is_err());
    }
}
