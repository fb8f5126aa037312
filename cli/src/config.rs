//! Persisted key=value configuration (`~/.fieldprov/fieldprov.env`).
//!
//! The file is a plain env-style text file: one `key=value` per line, `#`
//! comments and malformed lines skipped on load, keys written sorted. A
//! missing file is not an error — defaults apply. Values containing line
//! breaks are stored with literal `\n` escapes (see [`encode_multiline`]).

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Loaded configuration values, ordered by key.
pub type EnvConfig = BTreeMap<String, String>;

/// Known configuration keys.
pub mod keys {
    pub const IP_ADDRESS: &str = "ip_address";
    pub const BUNDLE_PATH: &str = "bundle_path";
    pub const FIRMWARE_PATH: &str = "firmware_path";
    pub const FIRMWARE_REVISION: &str = "firmware_revision";
    pub const FORCE_FIRMWARE_UPDATE: &str = "force_firmware_update";
    pub const CONTAINER_IMAGE: &str = "container_image";
    pub const CONTAINER_FLAGS: &str = "container_flags";
    pub const REGISTRY_ACCOUNT: &str = "registry_account";
    pub const REGISTRY_REGION: &str = "registry_region";
    pub const REGISTRY_TOKEN: &str = "registry_token";

    /// Every key accepted by `fieldprov config set`.
    pub const ALL: [&str; 10] = [
        IP_ADDRESS,
        BUNDLE_PATH,
        FIRMWARE_PATH,
        FIRMWARE_REVISION,
        FORCE_FIRMWARE_UPDATE,
        CONTAINER_IMAGE,
        CONTAINER_FLAGS,
        REGISTRY_ACCOUNT,
        REGISTRY_REGION,
        REGISTRY_TOKEN,
    ];
}

/// Manages the on-disk configuration file.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Creates a store pointing at `~/.fieldprov/fieldprov.env`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(Self::with_path(
            home.join(".fieldprov").join("fieldprov.env"),
        ))
    }

    /// Creates a store pointing at an arbitrary path (for testing).
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Loads the configuration. A missing file yields an empty map.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load(&self) -> Result<EnvConfig> {
        let mut cfg = EnvConfig::new();
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cfg),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("read {}", self.path.display()));
            }
        };

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            cfg.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(cfg)
    }

    /// Saves the configuration, creating the parent directory as needed.
    ///
    /// Sets file permissions to 600 and parent directory to 700 on Unix.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or permissions cannot
    /// be set.
    pub fn save(&self, cfg: &EnvConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
            set_permissions(parent, 0o700)?;
        }

        let mut content = String::new();
        for (key, value) in cfg {
            content.push_str(key);
            content.push('=');
            content.push_str(value);
            content.push('\n');
        }
        std::fs::write(&self.path, content)
            .with_context(|| format!("write {}", self.path.display()))?;
        set_permissions(&self.path, 0o600)?;
        Ok(())
    }
}

/// Escapes line breaks so a multi-line value fits on one `key=value` line.
#[must_use]
pub fn encode_multiline(value: &str) -> String {
    value.replace("\r\n", "\n").replace('\n', "\\n")
}

/// Restores a value previously escaped by [`encode_multiline`].
#[must_use]
pub fn decode_multiline(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    value.replace("\\n", "\n")
}

#[cfg(unix)]
fn set_permissions(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_permissions(_path: &std::path::Path, _mode: u32) -> Result<()> {
    Ok(())
}
