use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vigil_core::{DetectParams, LbphParams, Policy};

/// Camera device value that probes `/dev/video0..2`.
pub const AUTO_DEVICE: &str = "auto";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Application configuration: defaults, then an optional TOML file named by
/// `VIGIL_CONFIG`, then `VIGIL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path, or "auto" to probe /dev/video0..2.
    pub camera_device: String,
    /// SeetaFace model used for face localization.
    pub model_path: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Append-only recognition history.
    pub audit_log: PathBuf,
    /// Distances strictly below this are matches.
    pub match_threshold: f64,
    /// Seconds before the same person is reported again in a stream.
    pub dedup_cooldown_secs: f64,
    pub scale_factor: f64,
    /// Detector score below which candidates are dropped.
    pub score_threshold: f64,
    /// Smallest face side in pixels.
    pub min_face_size: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Delay after opening the camera before the test frame.
    pub warmup_ms: u64,
    pub lbph: LbphParams,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        let detect = DetectParams::default();
        let policy = Policy::default();
        Self {
            camera_device: AUTO_DEVICE.to_string(),
            model_path: default_model_path(&data_dir),
            db_path: data_dir.join("persons.db"),
            audit_log: data_dir.join("recognitions.txt"),
            match_threshold: policy.threshold,
            dedup_cooldown_secs: policy.cooldown.as_secs_f64(),
            scale_factor: detect.scale_factor,
            score_threshold: detect.score_threshold,
            min_face_size: detect.min_size,
            frame_width: 1280,
            frame_height: 720,
            warmup_ms: 500,
            lbph: LbphParams::default(),
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("VIGIL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `VIGIL_*` overrides. Unparseable numbers are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("VIGIL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("VIGIL_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("VIGIL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("VIGIL_AUDIT_LOG") {
            self.audit_log = PathBuf::from(v);
        }
        override_parsed(&lookup, "VIGIL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "VIGIL_DEDUP_COOLDOWN_SECS", &mut self.dedup_cooldown_secs);
        override_parsed(&lookup, "VIGIL_SCALE_FACTOR", &mut self.scale_factor);
        override_parsed(&lookup, "VIGIL_SCORE_THRESHOLD", &mut self.score_threshold);
        override_parsed(&lookup, "VIGIL_MIN_FACE_SIZE", &mut self.min_face_size);
        override_parsed(&lookup, "VIGIL_FRAME_WIDTH", &mut self.frame_width);
        override_parsed(&lookup, "VIGIL_FRAME_HEIGHT", &mut self.frame_height);
        override_parsed(&lookup, "VIGIL_WARMUP_MS", &mut self.warmup_ms);
    }

    pub fn detect_params(&self) -> DetectParams {
        DetectParams {
            scale_factor: self.scale_factor,
            score_threshold: self.score_threshold,
            min_size: self.min_face_size,
        }
    }

    pub fn policy(&self) -> Policy {
        let cooldown = Duration::try_from_secs_f64(self.dedup_cooldown_secs).unwrap_or_else(|_| {
            tracing::warn!(value = self.dedup_cooldown_secs, "invalid dedup cooldown, using default");
            Policy::default().cooldown
        });
        Policy {
            threshold: self.match_threshold,
            cooldown,
        }
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    /// `None` when the camera should be found by probing.
    pub fn camera_path(&self) -> Option<&str> {
        let device = self.camera_device.trim();
        (!device.is_empty() && device != AUTO_DEVICE).then_some(device)
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
}

/// Prefer a model in the data directory, then the system-wide install paths.
fn default_model_path(data_dir: &Path) -> PathBuf {
    const MODEL: &str = "seeta_fd_frontal_v1.0.bin";
    let candidates = [
        data_dir.join(MODEL),
        PathBuf::from("/usr/share/vigil").join(MODEL),
        PathBuf::from("/usr/local/share/vigil").join(MODEL),
    ];
    candidates
        .iter()
        .find(|p| p.exists())
        .cloned()
        .unwrap_or_else(|| data_dir.join(MODEL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_device, "auto");
        assert_eq!(config.camera_path(), None);
        assert_eq!(config.match_threshold, 80.0);
        assert_eq!(config.policy().cooldown, Duration::from_secs(3));
        assert_eq!(config.detect_params(), DetectParams::default());
        assert_eq!((config.frame_width, config.frame_height), (1280, 720));
        assert!(config.db_path.ends_with("vigil/persons.db"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            ("VIGIL_CAMERA_DEVICE", "/dev/video4"),
            ("VIGIL_MATCH_THRESHOLD", "65.5"),
            ("VIGIL_DEDUP_COOLDOWN_SECS", "10"),
            ("VIGIL_SCORE_THRESHOLD", "3.5"),
            ("VIGIL_DB_PATH", "/var/lib/vigil/p.db"),
        ]));
        assert_eq!(config.camera_path(), Some("/dev/video4"));
        assert_eq!(config.match_threshold, 65.5);
        assert_eq!(config.policy().cooldown, Duration::from_secs(10));
        assert_eq!(config.detect_params().score_threshold, 3.5);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/vigil/p.db"));
    }

    #[test]
    fn test_bad_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[("VIGIL_MIN_FACE_SIZE", "big")]));
        assert_eq!(config.min_face_size, 100);
    }

    #[test]
    fn test_negative_cooldown_falls_back() {
        let config = Config { dedup_cooldown_secs: -1.0, ..Config::default() };
        assert_eq!(config.policy().cooldown, Duration::from_secs(3));
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(
            &path,
            r#"
camera_device = "/dev/video1"
match_threshold = 70.0
min_face_size = 60

[lbph]
grid_x = 4
grid_y = 4
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.camera_path(), Some("/dev/video1"));
        assert_eq!(config.match_threshold, 70.0);
        assert_eq!(config.min_face_size, 60);
        assert_eq!(config.lbph.grid_x, 4);
        assert_eq!(config.lbph.radius, 1);
        assert_eq!(config.scale_factor, 1.1);
    }

    #[test]
    fn test_invalid_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "match_threshold = \"high\"").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
