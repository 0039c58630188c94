use facematch_core::{FaceOrder, DEFAULT_MATCH_THRESHOLD, DEFAULT_TOP_K};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_ADAPTER_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("unknown bus '{other}' (expected session or system)")),
        }
    }
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file, then `FACEMATCH_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory for saved uploads and batch crops.
    pub upload_dir: PathBuf,
    /// Maximum cosine distance for a positive match.
    pub match_threshold: f32,
    /// Result count used when a search asks for 0.
    pub default_top_k: usize,
    /// Upper bound on any single engine request.
    pub adapter_timeout_secs: u64,
    pub max_image_bytes: u64,
    /// Lowercase, without the leading dot.
    pub allowed_extensions: Vec<String>,
    pub face_order: FaceOrder,
    pub bus: BusKind,
}

/// On-disk shape of the config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub model_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub upload_dir: Option<PathBuf>,
    pub match_threshold: Option<f32>,
    pub default_top_k: Option<usize>,
    pub adapter_timeout_secs: Option<u64>,
    pub max_image_bytes: Option<u64>,
    pub allowed_extensions: Option<Vec<String>>,
    pub face_order: Option<FaceOrder>,
    pub bus: Option<BusKind>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    fn defaults(env: &impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = data_home(env).join("facematch");
        Self {
            model_dir: facematch_core::default_model_dir(),
            db_path: data_dir.join("faces.db"),
            upload_dir: data_dir.join("uploads"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            default_top_k: DEFAULT_TOP_K,
            adapter_timeout_secs: DEFAULT_ADAPTER_TIMEOUT_SECS,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            allowed_extensions: vec!["jpg".into(), "jpeg".into(), "png".into()],
            face_order: FaceOrder::default(),
            bus: BusKind::default(),
        }
    }

    /// Load configuration from the process environment and the config file it points at.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();

        let file = match config_file_path(&env) {
            Some(path) => {
                tracing::info!(path = %path.display(), "reading config file");
                Some(FileConfig::read(&path)?)
            }
            None => None,
        };

        Self::from_sources(file, env)
    }

    /// Layer a parsed config file and an environment lookup over the defaults.
    pub fn from_sources(
        file: Option<FileConfig>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(&env);
        if let Some(file) = file {
            config.apply_file(file);
        }
        config.apply_env(&env);
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.upload_dir {
            self.upload_dir = v;
        }
        if let Some(v) = file.match_threshold {
            self.match_threshold = v;
        }
        if let Some(v) = file.default_top_k {
            self.default_top_k = v;
        }
        if let Some(v) = file.adapter_timeout_secs {
            self.adapter_timeout_secs = v;
        }
        if let Some(v) = file.max_image_bytes {
            self.max_image_bytes = v;
        }
        if let Some(v) = file.allowed_extensions {
            self.allowed_extensions = v;
        }
        if let Some(v) = file.face_order {
            self.face_order = v;
        }
        if let Some(v) = file.bus {
            self.bus = v;
        }
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("FACEMATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FACEMATCH_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("FACEMATCH_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(v);
        }
        self.match_threshold = env_parse(env, "FACEMATCH_MATCH_THRESHOLD", self.match_threshold);
        self.default_top_k = env_parse(env, "FACEMATCH_DEFAULT_TOP_K", self.default_top_k);
        self.adapter_timeout_secs = env_parse(env, "FACEMATCH_ADAPTER_TIMEOUT_SECS", self.adapter_timeout_secs);
        self.max_image_bytes = env_parse(env, "FACEMATCH_MAX_IMAGE_BYTES", self.max_image_bytes);
        if let Some(v) = env("FACEMATCH_ALLOWED_EXTENSIONS") {
            self.allowed_extensions = v.split(',').map(str::to_string).collect();
        }
        self.face_order = env_parse(env, "FACEMATCH_FACE_ORDER", self.face_order);
        self.bus = env_parse(env, "FACEMATCH_BUS", self.bus);
    }

    fn normalize(&mut self) {
        self.allowed_extensions = self
            .allowed_extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold > 0.0 && self.match_threshold <= 2.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be in (0, 2], got {}",
                self.match_threshold
            )));
        }
        if self.default_top_k == 0 {
            return Err(ConfigError::Invalid("default_top_k must be at least 1".into()));
        }
        if self.adapter_timeout_secs == 0 {
            return Err(ConfigError::Invalid("adapter_timeout_secs must be at least 1".into()));
        }
        if self.max_image_bytes == 0 {
            return Err(ConfigError::Invalid("max_image_bytes must be positive".into()));
        }
        if self.allowed_extensions.is_empty() {
            return Err(ConfigError::Invalid("allowed_extensions must not be empty".into()));
        }
        Ok(())
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(facematch_core::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(facematch_core::ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn data_home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME").map(PathBuf::from).unwrap_or_else(|| {
        let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
        PathBuf::from(home).join(".local/share")
    })
}

/// `FACEMATCH_CONFIG` if set, else the XDG config file when it exists.
fn config_file_path(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(explicit) = env("FACEMATCH_CONFIG") {
        return Some(PathBuf::from(explicit));
    }
    let config_home = env("XDG_CONFIG_HOME").map(PathBuf::from).or_else(|| {
        env("HOME").map(|home| PathBuf::from(home).join(".config"))
    })?;
    let path = config_home.join("facematch/config.toml");
    path.exists().then_some(path)
}

/// Parse an environment override, keeping `current` if the variable is unset or malformed.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match env(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring malformed environment override");
                current
            }
        },
        None => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(None, env_from(&[])).unwrap();
        assert_eq!(config.match_threshold, 0.68);
        assert_eq!(config.default_top_k, 5);
        assert_eq!(config.adapter_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_image_bytes, 10 * 1024 * 1024);
        assert_eq!(config.allowed_extensions, ["jpg", "jpeg", "png"]);
        assert_eq!(config.face_order, FaceOrder::LeftToRight);
        assert_eq!(config.bus, BusKind::Session);
    }

    #[test]
    fn test_default_paths_follow_xdg_data_home() {
        let config = Config::from_sources(None, env_from(&[("XDG_DATA_HOME", "/data")])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/data/facematch/faces.db"));
        assert_eq!(config.upload_dir, PathBuf::from("/data/facematch/uploads"));
    }

    #[test]
    fn test_file_then_env_precedence() {
        let file: FileConfig = toml::from_str(
            r#"
            match_threshold = 0.5
            default_top_k = 10
            face_order = "detection"
            bus = "system"
            db_path = "/var/lib/facematch/faces.db"
            "#,
        )
        .unwrap();
        let env = env_from(&[("FACEMATCH_MATCH_THRESHOLD", "0.4"), ("FACEMATCH_UPLOAD_DIR", "/srv/uploads")]);

        let config = Config::from_sources(Some(file), env).unwrap();
        assert_eq!(config.match_threshold, 0.4);
        assert_eq!(config.default_top_k, 10);
        assert_eq!(config.face_order, FaceOrder::Detection);
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/facematch/faces.db"));
        assert_eq!(config.upload_dir, PathBuf::from("/srv/uploads"));
    }

    #[test]
    fn test_malformed_env_keeps_previous_value() {
        let config = Config::from_sources(None, env_from(&[("FACEMATCH_DEFAULT_TOP_K", "many")])).unwrap();
        assert_eq!(config.default_top_k, 5);
    }

    #[test]
    fn test_extensions_normalized() {
        let config =
            Config::from_sources(None, env_from(&[("FACEMATCH_ALLOWED_EXTENSIONS", " .JPG, png ,,webp")])).unwrap();
        assert_eq!(config.allowed_extensions, ["jpg", "png", "webp"]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for (key, value) in [
            ("FACEMATCH_MATCH_THRESHOLD", "0"),
            ("FACEMATCH_MATCH_THRESHOLD", "2.5"),
            ("FACEMATCH_DEFAULT_TOP_K", "0"),
            ("FACEMATCH_ADAPTER_TIMEOUT_SECS", "0"),
            ("FACEMATCH_ALLOWED_EXTENSIONS", ","),
        ] {
            let err = Config::from_sources(None, env_from(&[(key, value)])).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{key}={value}");
        }
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(toml::from_str::<FileConfig>("camera_device = \"/dev/video0\"").is_err());
    }

    #[test]
    fn test_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "adapter_timeout_secs = 5\n").unwrap();
        let file = FileConfig::read(&path).unwrap();
        assert_eq!(file.adapter_timeout_secs, Some(5));

        assert!(matches!(
            FileConfig::read(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let env = env_from(&[("FACEMATCH_CONFIG", "/etc/facematch.toml"), ("XDG_CONFIG_HOME", "/nowhere")]);
        assert_eq!(config_file_path(&env), Some(PathBuf::from("/etc/facematch.toml")));
        assert_eq!(config_file_path(&env_from(&[("XDG_CONFIG_HOME", "/nowhere")])), None);
    }

    #[test]
    fn test_model_paths() {
        let config = Config::from_sources(None, env_from(&[("FACEMATCH_MODEL_DIR", "/models")])).unwrap();
        assert_eq!(config.scrfd_model_path(), "/models/det_10g.onnx");
        assert_eq!(config.arcface_model_path(), "/models/w600k_r50.onnx");
    }
}
