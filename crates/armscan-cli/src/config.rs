//! Configuration vault – reads/writes `~/.armscan/config.toml`.

use armscan_perception::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persisted user configuration stored in `~/.armscan/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Seconds to wait for sensor metadata before warning.
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,

    /// Per-topic event bus buffer.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Fusion pipeline tunables.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_metadata_timeout_secs() -> u64 {
    30
}
fn default_bus_capacity() -> usize {
    armscan_middleware::bus::DEFAULT_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_timeout_secs: default_metadata_timeout_secs(),
            bus_capacity: default_bus_capacity(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }
}

/// Return the path to `~/.armscan/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".armscan").join("config.toml")
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `ARMSCAN_*` environment variable overrides to `cfg`.
///
/// Unparseable numeric values are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `ARMSCAN_RANGE_SCALE` | `pipeline.range_scale` |
/// | `ARMSCAN_MASK_RADIUS` | `pipeline.mask_radius` |
/// | `ARMSCAN_OUTPUT_FRAME` | `pipeline.output_frame_id` |
/// | `ARMSCAN_METADATA_TIMEOUT` | `metadata_timeout_secs` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ARMSCAN_RANGE_SCALE")
        && let Ok(scale) = v.parse::<u32>()
    {
        cfg.pipeline.range_scale = scale;
    }
    if let Ok(v) = std::env::var("ARMSCAN_MASK_RADIUS")
        && let Ok(radius) = v.parse::<u32>()
    {
        cfg.pipeline.mask_radius = radius;
    }
    if let Ok(v) = std::env::var("ARMSCAN_OUTPUT_FRAME")
        && !v.is_empty()
    {
        cfg.pipeline.output_frame_id = v;
    }
    if let Ok(v) = std::env::var("ARMSCAN_METADATA_TIMEOUT")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.metadata_timeout_secs = secs;
    }
}

/// Resolve the effective configuration.
///
/// An explicit `path` wins over `~/.armscan/config.toml`.  A missing file
/// yields defaults; a broken one is reported through the returned warning
/// and defaults are used.  Environment overrides apply in every case.
pub fn resolve(path: Option<&Path>) -> (Config, Option<String>) {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    let (mut cfg, warning) = match load_from(&path) {
        Ok(cfg) => (cfg.unwrap_or_default(), None),
        Err(e) => (Config::default(), Some(e)),
    };
    apply_env_overrides(&mut cfg);
    (cfg, warning)
}

/// Save the config to a specific path, creating its directory if needed.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
