//! Configuration vault – reads/writes `~/.zip/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zip_bridge::BridgeConfig;
use zip_types::ZipError;

/// Persisted operator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Run against the in-process simulated robot instead of a serial port.
    #[serde(default)]
    pub sim: bool,

    /// Serial link, streaming defaults and event log location.
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// `~/.zip/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// `~/.zip/safe_mode.bin`, the simulated board's reset-retained record.
pub fn safe_mode_path() -> PathBuf {
    PathBuf::from(home_dir()).join(".zip").join("safe_mode.bin")
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".zip").join("config.toml")
}

/// Load the vault with `ZIP_*` overrides applied.  `None` if absent.
pub fn load() -> Result<Option<Config>, ZipError> {
    let Some(mut cfg) = load_from(&config_path())? else {
        return Ok(None);
    };
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Load a vault file without applying overrides.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ZipError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        ZipError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| ZipError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply environment overrides to `cfg`.
///
/// | Variable | Field |
/// |---|---|
/// | `ZIP_SERIAL_PORT` | `bridge.port` |
/// | `ZIP_BAUD` | `bridge.baud` |
/// | `ZIP_RATE_HZ` | `bridge.default_rate_hz` |
/// | `ZIP_TTL_MS` | `bridge.default_ttl_ms` |
/// | `ZIP_LOG_PATH` | `bridge.log_path` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides<F>(cfg: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let bridge = &mut cfg.bridge;
    if let Some(port) = lookup("ZIP_SERIAL_PORT") {
        bridge.port = port;
    }
    if let Some(baud) = lookup("ZIP_BAUD").and_then(|v| v.trim().parse().ok()) {
        bridge.baud = baud;
    }
    if let Some(rate) = lookup("ZIP_RATE_HZ")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|r| r.is_finite() && *r > 0.0)
    {
        bridge.default_rate_hz = rate;
    }
    if let Some(ttl) = lookup("ZIP_TTL_MS").and_then(|v| v.trim().parse().ok()) {
        bridge.default_ttl_ms = ttl;
    }
    if let Some(path) = lookup("ZIP_LOG_PATH").filter(|p| !p.is_empty()) {
        bridge.log_path = Some(PathBuf::from(path));
    }
}

/// Save the vault, creating `~/.zip/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ZipError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ZipError> {
    let io_err = |what: &str, e: std::io::Error| {
        ZipError::Config(format!("{what} {}: {e}", path.display()))
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err("failed to create directory for", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_err("failed to restrict directory of", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| ZipError::Config(format!("failed to serialise config: {e}")))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| io_err("failed to write", e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| io_err("failed to write", e))?;
    Ok(())
}
