//! Resolved, immutable run settings.
//!
//! [`Settings`] is built exactly once at startup from the config file and the
//! command-line overrides, then handed to every component by reference.
//! Credential files are read here so that an unreadable key fails the run
//! before any artifact is attempted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::ForgeError;
use crate::util::config::{project_dirs, Config};
use crate::util::hash::sha256_str;

/// A credential value that never prints.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    /// The raw value, for handing to a collaborator.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// One-way digest used wherever the credential must influence a signature.
    pub fn digest(&self) -> String {
        sha256_str(&self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Overrides collected from the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub catalog: Option<PathBuf>,
    pub dry_run: bool,
    pub no_delay: bool,
    pub no_change_tracking: bool,
    pub keep_going: bool,
}

/// Virtualization host parameters.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub qm: PathBuf,
    pub storage: String,
    pub bridge: String,
    pub memory_mb: u32,
    pub cores: u32,
    pub disk_size: String,
    pub scsihw: String,
}

/// Image tool parameters.
#[derive(Debug, Clone)]
pub struct ImageSettings {
    pub virt_sysprep: PathBuf,
    pub virt_customize: PathBuf,
    pub timezone: String,
    pub locale: String,
    pub sanitize: bool,
    pub guest_agent: bool,
    pub serial_console: bool,
}

/// Cloud-init parameters with credential material already loaded.
#[derive(Debug, Clone, Default)]
pub struct CloudInitSettings {
    pub user: Option<String>,
    pub ssh_keys_file: Option<PathBuf>,
    /// Contents of `ssh_keys_file`
    pub ssh_keys: Option<Secret>,
    /// Pre-hashed password read from `password_hash_file`
    pub password_hash: Option<Secret>,
    pub nameserver: Option<String>,
    pub searchdomain: Option<String>,
    pub ipconfig: String,
}

/// Deadlines for collaborator calls.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub fetch: Duration,
    pub control: Duration,
    pub image_tool: Duration,
}

/// Everything a run needs to know, fixed for its whole duration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub catalog_path: PathBuf,
    pub cache_dir: PathBuf,
    pub state_dir: PathBuf,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    pub host: HostSettings,
    pub image: ImageSettings,
    pub cloud_init: CloudInitSettings,
    pub change_tracking: bool,
    pub keep_going: bool,
    pub dry_run: bool,
    /// Settle delay around the disk resize; zero when disabled
    pub resize_delay: Duration,
    pub timeouts: Timeouts,
}

/// Default catalog file name, looked up next to the config.
pub const DEFAULT_CATALOG_FILE: &str = "catalog.toml";

impl Settings {
    /// Resolve the final settings.
    ///
    /// Relative paths in the config file are taken relative to `base_dir`
    /// (the config file's directory); relative CLI paths stay relative to the
    /// process working directory.
    pub fn resolve(
        config: Config,
        overrides: &Overrides,
        base_dir: &Path,
    ) -> Result<Settings, ForgeError> {
        let rel = |p: PathBuf| if p.is_absolute() { p } else { base_dir.join(p) };

        let (default_cache, default_state, default_log) = match project_dirs() {
            Some(dirs) => (
                dirs.cache_dir().join("images"),
                dirs.data_dir().join("state"),
                dirs.data_local_dir().join("logs"),
            ),
            None => {
                let root = base_dir.join(".imgforge");
                (root.join("images"), root.join("state"), root.join("logs"))
            }
        };

        let paths = config.paths;
        let catalog_path = match &overrides.catalog {
            Some(path) => path.clone(),
            None => rel(paths
                .catalog
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_FILE))),
        };
        let cache_dir = paths.cache_dir.map(&rel).unwrap_or(default_cache);
        let work_dir = paths
            .work_dir
            .map(&rel)
            .unwrap_or_else(|| cache_dir.join("work"));

        let host = config.host;
        if host.memory_mb == 0 || host.cores == 0 {
            return Err(ForgeError::configuration(
                "host.memory_mb and host.cores must be greater than zero",
            ));
        }
        if host.storage.trim().is_empty() || host.bridge.trim().is_empty() {
            return Err(ForgeError::configuration(
                "host.storage and host.bridge must not be empty",
            ));
        }
        if !is_disk_size(&host.disk_size) {
            return Err(ForgeError::configuration(format!(
                "host.disk_size `{}` is not a size like `32G`",
                host.disk_size
            )));
        }

        let ci = config.cloud_init;
        let ssh_keys_file = ci.ssh_keys_file.map(&rel);
        let ssh_keys = ssh_keys_file
            .as_deref()
            .map(|p| read_credential(p, "cloud_init.ssh_keys_file"))
            .transpose()?;
        let password_hash = ci
            .password_hash_file
            .map(&rel)
            .map(|p| read_credential(&p, "cloud_init.password_hash_file"))
            .transpose()?;

        let resize_delay = if overrides.no_delay {
            Duration::ZERO
        } else {
            Duration::from_secs(config.build.resize_delay_secs)
        };

        Ok(Settings {
            catalog_path,
            cache_dir,
            state_dir: paths.state_dir.map(&rel).unwrap_or(default_state),
            work_dir,
            log_dir: paths.log_dir.map(&rel).unwrap_or(default_log),
            host: HostSettings {
                qm: host.qm,
                storage: host.storage,
                bridge: host.bridge,
                memory_mb: host.memory_mb,
                cores: host.cores,
                disk_size: host.disk_size,
                scsihw: host.scsihw,
            },
            image: ImageSettings {
                virt_sysprep: config.image.virt_sysprep,
                virt_customize: config.image.virt_customize,
                timezone: config.image.timezone,
                locale: config.image.locale,
                sanitize: config.image.sanitize,
                guest_agent: config.image.guest_agent,
                serial_console: config.image.serial_console,
            },
            cloud_init: CloudInitSettings {
                user: non_empty(ci.user),
                ssh_keys_file,
                ssh_keys,
                password_hash,
                nameserver: non_empty(ci.nameserver),
                searchdomain: non_empty(ci.searchdomain),
                ipconfig: non_empty(ci.ipconfig).unwrap_or_else(|| "ip=dhcp".to_string()),
            },
            change_tracking: config.build.change_tracking && !overrides.no_change_tracking,
            keep_going: config.build.keep_going || overrides.keep_going,
            dry_run: overrides.dry_run,
            resize_delay,
            timeouts: Timeouts {
                fetch: Duration::from_secs(config.timeouts.fetch_secs),
                control: Duration::from_secs(config.timeouts.control_secs),
                image_tool: Duration::from_secs(config.timeouts.image_tool_secs),
            },
        })
    }
}

fn read_credential(path: &Path, key: &str) -> Result<Secret, ForgeError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ForgeError::configuration(format!("{} `{}` is unreadable: {}", key, path.display(), e))
    })?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err(ForgeError::configuration(format!(
            "{} `{}` is empty",
            key,
            path.display()
        )));
    }
    Ok(Secret::new(trimmed))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Accepts `qm resize` style sizes: digits with an optional K/M/G/T suffix.
pub fn is_disk_size(value: &str) -> bool {
    let digits = value.trim_end_matches(['K', 'M', 'G', 'T']);
    !digits.is_empty()
        && value.len() - digits.len() <= 1
        && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_defaults_and_overrides() {
        let tmp = TempDir::new().unwrap();
        let overrides = Overrides {
            dry_run: true,
            no_delay: true,
            no_change_tracking: true,
            ..Overrides::default()
        };

        let settings = Settings::resolve(Config::default(), &overrides, tmp.path()).unwrap();
        assert!(settings.dry_run);
        assert!(!settings.change_tracking);
        assert_eq!(settings.resize_delay, Duration::ZERO);
        assert_eq!(settings.catalog_path, tmp.path().join(DEFAULT_CATALOG_FILE));
        assert_eq!(settings.cloud_init.ipconfig, "ip=dhcp");
        assert!(settings.cloud_init.password_hash.is_none());
    }

    #[test]
    fn test_credentials_are_loaded_and_redacted() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("pw.hash"), "$6$salt$abc\n").unwrap();
        std::fs::write(tmp.path().join("id.pub"), "ssh-ed25519 AAAA admin@host\n").unwrap();

        let mut config = Config::default();
        config.cloud_init.password_hash_file = Some(PathBuf::from("pw.hash"));
        config.cloud_init.ssh_keys_file = Some(PathBuf::from("id.pub"));

        let settings = Settings::resolve(config, &Overrides::default(), tmp.path()).unwrap();
        let password = settings.cloud_init.password_hash.as_ref().unwrap();
        assert_eq!(password.expose(), "$6$salt$abc");
        assert_eq!(password.digest(), sha256_str("$6$salt$abc"));
        assert!(!format!("{:?}", settings).contains("$6$salt$abc"));
        assert!(!format!("{:?}", settings).contains("AAAA"));
    }

    #[test]
    fn test_unreadable_credential_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.cloud_init.ssh_keys_file = Some(PathBuf::from("missing.pub"));

        let err = Settings::resolve(config, &Overrides::default(), tmp.path()).unwrap_err();
        assert!(matches!(err, ForgeError::Configuration(_)));
        assert!(err.is_startup());
    }

    #[test]
    fn test_bad_disk_size_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.host.disk_size = "big".to_string();
        assert!(Settings::resolve(config, &Overrides::default(), tmp.path()).is_err());
    }

    #[test]
    fn test_is_disk_size() {
        assert!(is_disk_size("32G"));
        assert!(is_disk_size("2048M"));
        assert!(is_disk_size("100"));
        assert!(!is_disk_size("G"));
        assert!(!is_disk_size("32GG"));
        assert!(!is_disk_size("3.5G"));
    }
}
