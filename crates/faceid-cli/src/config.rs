use faceid_core::{EnrollSettings, LockSettings, TensorLayout};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config file read when `FACEID_CONFIG` is not set.
const DEFAULT_CONFIG_FILE: &str = "faceid.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Runtime configuration. Loaded once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SCRFD face detector model.
    pub detector_model: PathBuf,
    /// Face embedder model.
    pub embedder_model: PathBuf,
    /// Input tensor layout of the embedder.
    pub embedder_layout: TensorLayout,
    /// Where the enrolled reference embedding lives.
    pub enroll_path: PathBuf,
    /// Camera index, mapped to `/dev/video{cam_index}`.
    pub cam_index: u32,
    /// Number of embeddings averaged during enrollment.
    pub enroll_frames: usize,
    /// Consecutive matching frames needed to unlock.
    pub required_consecutive: usize,
    /// Cosine distance threshold; lower is stricter.
    pub match_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detector_model: PathBuf::from("models/det_10g.onnx"),
            embedder_model: PathBuf::from("models/arcface.onnx"),
            embedder_layout: TensorLayout::Nhwc,
            enroll_path: PathBuf::from("data/enrolled.bin"),
            cam_index: 0,
            enroll_frames: 20,
            required_consecutive: 8,
            match_threshold: 0.35,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file, then `FACEID_*` environment variables.
    ///
    /// The file is `$FACEID_CONFIG` (must exist) or `./faceid.toml` (optional).
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEID_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `FACEID_*` variables looked up through `lookup`.
    /// Values that fail to parse are skipped with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEID_DETECTOR_MODEL") {
            self.detector_model = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEID_EMBEDDER_MODEL") {
            self.embedder_model = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEID_ENROLL_PATH") {
            self.enroll_path = PathBuf::from(v);
        }
        override_parsed(&lookup, "FACEID_EMBEDDER_LAYOUT", &mut self.embedder_layout, |v| {
            match v.to_ascii_lowercase().as_str() {
                "nchw" => Some(TensorLayout::Nchw),
                "nhwc" => Some(TensorLayout::Nhwc),
                _ => None,
            }
        });
        override_parsed(&lookup, "FACEID_CAM_INDEX", &mut self.cam_index, |v| v.parse().ok());
        override_parsed(&lookup, "FACEID_ENROLL_FRAMES", &mut self.enroll_frames, |v| {
            v.parse().ok()
        });
        override_parsed(
            &lookup,
            "FACEID_REQUIRED_CONSECUTIVE",
            &mut self.required_consecutive,
            |v| v.parse().ok(),
        );
        override_parsed(&lookup, "FACEID_MATCH_THRESHOLD", &mut self.match_threshold, |v| {
            v.parse().ok()
        });
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enroll_frames == 0 {
            return Err(ConfigError::Invalid {
                key: "enroll_frames",
                reason: "must be at least 1".into(),
            });
        }
        if self.required_consecutive == 0 {
            return Err(ConfigError::Invalid {
                key: "required_consecutive",
                reason: "must be at least 1".into(),
            });
        }
        if !self.match_threshold.is_finite() {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                reason: format!("{} is not a finite number", self.match_threshold),
            });
        }
        Ok(())
    }

    pub fn camera_device(&self) -> String {
        faceid_hw::device_path(self.cam_index)
    }

    pub fn enroll_settings(&self) -> EnrollSettings {
        EnrollSettings {
            target_frames: self.enroll_frames,
            output: self.enroll_path.clone(),
        }
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            required_consecutive: self.required_consecutive,
            match_threshold: self.match_threshold,
        }
    }
}

fn override_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    field: &mut T,
    parse: impl Fn(&str) -> Option<T>,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match parse(raw.trim()) {
        Some(value) => *field = value,
        None => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.enroll_frames, 20);
        assert_eq!(config.required_consecutive, 8);
        assert!((config.match_threshold - 0.35).abs() < 1e-6);
        assert_eq!(config.enroll_path, PathBuf::from("data/enrolled.bin"));
        assert_eq!(config.embedder_model, PathBuf::from("models/arcface.onnx"));
        assert_eq!(config.embedder_layout, TensorLayout::Nhwc);
        assert_eq!(config.camera_device(), "/dev/video0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            enroll_frames = 5
            match_threshold = 0.3
            embedder_layout = "nchw"
            "#,
        )
        .unwrap();
        assert_eq!(config.enroll_frames, 5);
        assert!((config.match_threshold - 0.3).abs() < 1e-6);
        assert_eq!(config.embedder_layout, TensorLayout::Nchw);
        assert_eq!(config.required_consecutive, 8);
        assert_eq!(config.detector_model, PathBuf::from("models/det_10g.onnx"));
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(Config::from_toml("enrol_frames = 5").is_err());
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Config::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));

        let path = dir.path().join("faceid.toml");
        std::fs::write(&path, "cam_index = \"zero\"").unwrap();
        let bad = Config::from_file(&path).unwrap_err();
        assert!(matches!(bad, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("FACEID_CAM_INDEX", "2"),
            ("FACEID_ENROLL_FRAMES", " 3 "),
            ("FACEID_MATCH_THRESHOLD", "0.25"),
            ("FACEID_EMBEDDER_LAYOUT", "NCHW"),
            ("FACEID_ENROLL_PATH", "/tmp/me.bin"),
        ]));
        assert_eq!(config.cam_index, 2);
        assert_eq!(config.camera_device(), "/dev/video2");
        assert_eq!(config.enroll_frames, 3);
        assert!((config.match_threshold - 0.25).abs() < 1e-6);
        assert_eq!(config.embedder_layout, TensorLayout::Nchw);
        assert_eq!(config.enroll_path, PathBuf::from("/tmp/me.bin"));
    }

    #[test]
    fn test_bad_env_override_ignored() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("FACEID_REQUIRED_CONSECUTIVE", "many"),
            ("FACEID_EMBEDDER_LAYOUT", "chw"),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_rejects_zero_counts() {
        let config = Config {
            enroll_frames: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "enroll_frames", .. })
        ));

        let config = Config {
            required_consecutive: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            match_threshold: f32::NAN,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_settings() {
        let config = Config::default();
        let enroll = config.enroll_settings();
        assert_eq!(enroll.target_frames, 20);
        assert_eq!(enroll.output, config.enroll_path);
        let lock = config.lock_settings();
        assert_eq!(lock.required_consecutive, 8);
        assert_eq!(lock.match_threshold, config.match_threshold);
    }
}
