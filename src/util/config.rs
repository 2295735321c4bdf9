//! Configuration file support.
//!
//! imgforge reads a single TOML file. The first one found wins:
//! 1. `--config <path>` (or `IMGFORGE_CONFIG`)
//! 2. `./imgforge.toml`
//! 3. `<user config dir>/imgforge/config.toml`
//!
//! Every field is optional; missing values fall back to the defaults below.
//! The file is only read here. Components receive the resolved
//! [`Settings`](crate::util::context::Settings) instead.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Name of the project-local config file.
pub const PROJECT_CONFIG_FILE: &str = "imgforge.toml";

/// imgforge configuration as written on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: PathsConfig,
    pub host: HostConfig,
    pub image: ImageConfig,
    pub cloud_init: CloudInitConfig,
    pub build: BuildConfig,
    pub timeouts: TimeoutConfig,
}

/// Where things live on the local machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Catalog document (TOML or JSON)
    pub catalog: Option<PathBuf>,
    /// Downloaded source images
    pub cache_dir: Option<PathBuf>,
    /// Per-artifact state records
    pub state_dir: Option<PathBuf>,
    /// Scratch space for working copies
    pub work_dir: Option<PathBuf>,
    /// Per-run log files
    pub log_dir: Option<PathBuf>,
}

/// Virtualization host parameters shared by every template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Path or name of the `qm` binary
    pub qm: PathBuf,
    /// Storage pool receiving imported disks
    pub storage: String,
    /// Network bridge for `net0`
    pub bridge: String,
    pub memory_mb: u32,
    pub cores: u32,
    /// Final size of the primary disk (e.g. `"32G"`)
    pub disk_size: String,
    /// SCSI controller model
    pub scsihw: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            qm: PathBuf::from("qm"),
            storage: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            memory_mb: 2048,
            cores: 2,
            disk_size: "32G".to_string(),
            scsihw: "virtio-scsi-pci".to_string(),
        }
    }
}

/// Image customization applied to every working copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub virt_sysprep: PathBuf,
    pub virt_customize: PathBuf,
    pub timezone: String,
    pub locale: String,
    /// Strip machine-unique identifiers before customizing
    pub sanitize: bool,
    /// Enable the QEMU guest agent hook
    pub guest_agent: bool,
    /// Attach a serial console and use it as the display
    pub serial_console: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            virt_sysprep: PathBuf::from("virt-sysprep"),
            virt_customize: PathBuf::from("virt-customize"),
            timezone: "UTC".to_string(),
            locale: "en_US.UTF-8".to_string(),
            sanitize: true,
            guest_agent: true,
            serial_console: true,
        }
    }
}

/// Cloud-init settings injected into every template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudInitConfig {
    pub user: Option<String>,
    /// Public key file passed to `--sshkeys`
    pub ssh_keys_file: Option<PathBuf>,
    /// File holding an already crypt-hashed password
    pub password_hash_file: Option<PathBuf>,
    pub nameserver: Option<String>,
    pub searchdomain: Option<String>,
    /// `ipconfig0` value, `ip=dhcp` when unset
    pub ipconfig: Option<String>,
}

/// Orchestration behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Skip artifacts whose signature and source are unchanged
    pub change_tracking: bool,
    /// Continue with the next artifact after a failure
    pub keep_going: bool,
    /// Settle delay before and after the disk resize, in seconds
    pub resize_delay_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            change_tracking: true,
            keep_going: false,
            resize_delay_secs: 5,
        }
    }
}

/// Deadlines for collaborator calls, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub fetch_secs: u64,
    pub control_secs: u64,
    pub image_tool_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            fetch_secs: 3600,
            control_secs: 600,
            image_tool_secs: 1800,
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.display()))
    }
}

/// Project directories for imgforge.
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "imgforge", "imgforge")
}

/// Get the user-wide config path (`<config dir>/config.toml`).
pub fn global_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

/// Find the config file to use, honouring the lookup order.
///
/// An explicit path must exist; implicit locations are optional.
pub fn locate_config(explicit: Option<&Path>, cwd: &Path) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            anyhow::bail!("config file not found: {}", path.display());
        }
        return Ok(Some(path.to_path_buf()));
    }

    let project = cwd.join(PROJECT_CONFIG_FILE);
    if project.exists() {
        return Ok(Some(project));
    }

    Ok(global_config_path().filter(|p| p.exists()))
}

/// Load the effective configuration, or defaults when no file exists.
pub fn load_config(explicit: Option<&Path>, cwd: &Path) -> Result<(Config, Option<PathBuf>)> {
    match locate_config(explicit, cwd)? {
        Some(path) => {
            tracing::debug!("loading config from {}", path.display());
            Ok((Config::load(&path)?, Some(path)))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok((Config::default(), None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.host.bridge, "vmbr0");
        assert!(config.build.change_tracking);
        assert!(!config.build.keep_going);
        assert!(config.image.sanitize);
        assert_eq!(config.timeouts.control_secs, 600);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(PROJECT_CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[host]
bridge = "vmbr1"
disk_size = "20G"

[cloud_init]
user = "admin"
nameserver = "1.1.1.1"

[build]
keep_going = true
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.host.bridge, "vmbr1");
        assert_eq!(config.host.disk_size, "20G");
        assert_eq!(config.host.storage, "local-lvm");
        assert_eq!(config.cloud_init.user.as_deref(), Some("admin"));
        assert!(config.build.keep_going);
        assert!(config.build.change_tracking);
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "[hots]\nbridge = \"vmbr1\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_locate_prefers_explicit_then_project() {
        let tmp = TempDir::new().unwrap();
        let explicit = tmp.path().join("custom.toml");
        std::fs::write(&explicit, "").unwrap();
        std::fs::write(tmp.path().join(PROJECT_CONFIG_FILE), "").unwrap();

        let found = locate_config(Some(&explicit), tmp.path()).unwrap();
        assert_eq!(found, Some(explicit));

        let found = locate_config(None, tmp.path()).unwrap();
        assert_eq!(found, Some(tmp.path().join(PROJECT_CONFIG_FILE)));

        let missing = tmp.path().join("missing.toml");
        assert!(locate_config(Some(&missing), tmp.path()).is_err());
    }
}
