//! Test fixtures for common test scenarios.

use std::path::Path;

use crate::core::catalog::{Catalog, ChecksumAlgorithm, ChecksumSpec};
use crate::util::config::Config;
use crate::util::context::{Overrides, Settings};
use crate::util::hash::sha256_bytes;

/// Three images in declared order; `Debian 12` is vmid 9000.
pub const CATALOG_TOML: &str = r#"
[[image]]
id = "debian-12"
label = "Debian 12"
vmid = 9000
name = "debian-12-cloud"
source = "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2"
packages = ["qemu-guest-agent", "curl"]

[[image]]
id = "ubuntu-noble"
label = "Ubuntu 24.04"
vmid = 9001
name = "ubuntu-2404-cloud"
source = "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img"
packages = ["qemu-guest-agent"]

[[image]]
id = "rocky-9"
label = "Rocky 9"
vmid = "9002"
name = "rocky-9-cloud"
source = "https://dl.rockylinux.org/pub/rocky/9/images/x86_64/Rocky-9-GenericCloud.latest.x86_64.qcow2"
disk_size = "20G"
"#;

/// The fixture catalog, as if loaded from `<root>/catalog.toml`.
pub fn catalog(root: &Path) -> Catalog {
    Catalog::parse(CATALOG_TOML, &root.join("catalog.toml")).unwrap()
}

/// Settings with every directory under `root` and no resize delay.
pub fn settings(root: &Path) -> Settings {
    settings_with(root, |_| {})
}

/// Like [`settings`], with a hook to adjust the config first.
pub fn settings_with(root: &Path, adjust: impl FnOnce(&mut Config)) -> Settings {
    let mut config = Config::default();
    config.paths.catalog = Some(root.join("catalog.toml"));
    config.paths.cache_dir = Some(root.join("cache"));
    config.paths.state_dir = Some(root.join("state"));
    config.paths.work_dir = Some(root.join("work"));
    config.paths.log_dir = Some(root.join("logs"));
    config.build.resize_delay_secs = 0;
    adjust(&mut config);

    Settings::resolve(config, &Overrides::default(), root).unwrap()
}

/// A sha256 checksum spec matching `bytes`.
pub fn checksum_of(bytes: &[u8]) -> ChecksumSpec {
    ChecksumSpec {
        algorithm: ChecksumAlgorithm::Sha256,
        digest: sha256_bytes(bytes),
    }
}
