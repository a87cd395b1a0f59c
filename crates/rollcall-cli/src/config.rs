use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {key} = {value}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Application configuration.
///
/// Precedence: `ROLLCALL_*` environment variables, then the TOML config file,
/// then built-in defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture resolution.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory holding people.jsonl, faces/ and attendance.jsonl.
    pub data_dir: PathBuf,
    /// Similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Frames discarded before capture (auto-exposure settling).
    pub warmup_frames: usize,
    /// Frames tried per capture before giving up on dark frames.
    pub capture_attempts: usize,
    /// External embedding command; the image path is appended as last argument.
    pub engine_command: Vec<String>,
}

/// On-disk form of [`Config`]; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    camera_width: Option<u32>,
    camera_height: Option<u32>,
    data_dir: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    warmup_frames: Option<usize>,
    capture_attempts: Option<usize>,
    engine_command: Option<Vec<String>>,
}

impl Config {
    /// Load from the process environment and the default config file location.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let file = env("ROLLCALL_CONFIG")
            .map(PathBuf::from)
            .or_else(|| default_config_path(&env));
        Self::from_sources(file.as_deref(), env)
    }

    /// Build a config from an optional TOML file and an environment lookup.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn from_sources(
        file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file_cfg = match file {
            Some(path) => read_file(path)?,
            None => FileConfig::default(),
        };

        let data_dir = env("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .or(file_cfg.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        let similarity_threshold = env_parse(&env, "ROLLCALL_SIMILARITY_THRESHOLD")
            .or(file_cfg.similarity_threshold)
            .unwrap_or(0.40);
        if !(-1.0..=1.0).contains(&similarity_threshold) {
            return Err(ConfigError::Invalid {
                key: "similarity_threshold",
                value: similarity_threshold.to_string(),
                reason: "must be a number between -1 and 1",
            });
        }

        let engine_command = env("ROLLCALL_ENGINE_COMMAND")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .or(file_cfg.engine_command)
            .unwrap_or_default();

        Ok(Self {
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file_cfg.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            camera_width: env_parse(&env, "ROLLCALL_CAMERA_WIDTH")
                .or(file_cfg.camera_width)
                .unwrap_or(640),
            camera_height: env_parse(&env, "ROLLCALL_CAMERA_HEIGHT")
                .or(file_cfg.camera_height)
                .unwrap_or(480),
            data_dir,
            similarity_threshold,
            warmup_frames: env_parse(&env, "ROLLCALL_WARMUP_FRAMES")
                .or(file_cfg.warmup_frames)
                .unwrap_or(4),
            capture_attempts: env_parse(&env, "ROLLCALL_CAPTURE_ATTEMPTS")
                .or(file_cfg.capture_attempts)
                .unwrap_or(5),
            engine_command,
        })
    }

    /// Directory of the enrollment store.
    pub fn people_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    /// Path of the attendance ledger.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("attendance.jsonl")
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file");
            return Ok(FileConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}

fn home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    PathBuf::from(env("HOME").unwrap_or_else(|| "/tmp".to_string()))
}

fn default_config_path(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let base = env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".config"));
    Some(base.join("rollcall").join("config.toml"))
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".local/share"))
        .join("rollcall")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_sources(None, env_of(&[("HOME", "/home/u")])).unwrap();
        assert_eq!(cfg.camera_device, "/dev/video0");
        assert_eq!(cfg.data_dir, PathBuf::from("/home/u/.local/share/rollcall"));
        assert_eq!(cfg.ledger_path(), PathBuf::from("/home/u/.local/share/rollcall/attendance.jsonl"));
        assert!((cfg.similarity_threshold - 0.40).abs() < 1e-6);
        assert_eq!((cfg.camera_width, cfg.camera_height), (640, 480));
        assert_eq!(cfg.warmup_frames, 4);
        assert_eq!(cfg.capture_attempts, 5);
        assert!(cfg.engine_command.is_empty());
    }

    #[test]
    fn test_file_then_env_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
camera_device = "/dev/video4"
data_dir = "/srv/rollcall"
similarity_threshold = 0.55
engine_command = ["python3", "embed.py", "--model", "VGG-Face"]
"#
        )
        .unwrap();

        let cfg = Config::from_sources(
            Some(file.path()),
            env_of(&[("ROLLCALL_SIMILARITY_THRESHOLD", "0.7"), ("ROLLCALL_WARMUP_FRAMES", "0")]),
        )
        .unwrap();

        assert_eq!(cfg.camera_device, "/dev/video4");
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/rollcall"));
        assert!((cfg.similarity_threshold - 0.7).abs() < 1e-6);
        assert_eq!(cfg.warmup_frames, 0);
        assert_eq!(cfg.engine_command, vec!["python3", "embed.py", "--model", "VGG-Face"]);
    }

    #[test]
    fn test_env_engine_command_is_split() {
        let cfg = Config::from_sources(
            None,
            env_of(&[("HOME", "/h"), ("ROLLCALL_ENGINE_COMMAND", "deepface-embed  --json")]),
        )
        .unwrap();
        assert_eq!(cfg.engine_command, vec!["deepface-embed", "--json"]);
    }

    #[test]
    fn test_bad_env_value_falls_back() {
        let cfg = Config::from_sources(
            None,
            env_of(&[("HOME", "/h"), ("ROLLCALL_CAPTURE_ATTEMPTS", "lots")]),
        )
        .unwrap();
        assert_eq!(cfg.capture_attempts, 5);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::from_sources(Some(dir.path().join("nope.toml").as_path()), env_of(&[("HOME", "/h")]))
            .unwrap();
        assert_eq!(cfg.camera_device, "/dev/video0");
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "similarity_treshold = 0.5").unwrap();
        let err = Config::from_sources(Some(file.path()), env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_threshold_must_be_a_similarity() {
        for raw in ["nan", "NaN", "inf", "1.5", "-2"] {
            let err = Config::from_sources(None, env_of(&[("ROLLCALL_SIMILARITY_THRESHOLD", raw)]))
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { key: "similarity_threshold", .. }),
                "{raw}: {err}"
            );
        }

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "similarity_threshold = nan").unwrap();
        let err = Config::from_sources(Some(file.path()), env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let cfg = Config::from_sources(None, env_of(&[("ROLLCALL_SIMILARITY_THRESHOLD", "-1")])).unwrap();
        assert_eq!(cfg.similarity_threshold, -1.0);
    }

    #[test]
    fn test_xdg_dirs() {
        let env = env_of(&[("XDG_DATA_HOME", "/data"), ("XDG_CONFIG_HOME", "/cfg")]);
        assert_eq!(default_config_path(&env), Some(PathBuf::from("/cfg/rollcall/config.toml")));
        assert_eq!(default_data_dir(&env), PathBuf::from("/data/rollcall"));
    }
}
