//! Collaborator interfaces.
//!
//! The pipeline talks to the outside world through three narrow traits:
//! [`ResourceControl`] (the hypervisor control plane), [`ImageTool`] (offline
//! disk image sanitize/customize) and [`Fetcher`] (source image transfer).
//! Every call is a single blocking operation; failures come back as
//! `anyhow::Error` and the pipeline attributes them to the current step.
//!
//! The shipped adapters drive Proxmox VE `qm`, libguestfs and HTTP(S).

pub mod fetch;
pub mod guestfs;
pub mod proxmox;

use std::path::{Path, PathBuf};

use anyhow::Result;
use url::Url;

use crate::util::context::Secret;

pub use fetch::HttpFetcher;
pub use guestfs::GuestfsTool;
pub use proxmox::QmControl;

/// Compute parameters of a new VM shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub vmid: u32,
    pub name: String,
    pub memory_mb: u32,
    pub cores: u32,
    pub bridge: String,
}

/// Hardware and cloud-init configuration applied after the disk import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachSpec {
    /// Imported disk handle as reported by the control plane
    pub disk: String,
    pub scsihw: String,
    pub serial_console: bool,
    pub guest_agent: bool,
    pub ci_user: Option<String>,
    /// Public key file handed to the control plane as-is
    pub ssh_keys_file: Option<PathBuf>,
    pub password_hash: Option<Secret>,
    pub nameserver: Option<String>,
    pub searchdomain: Option<String>,
    pub ipconfig: String,
}

/// Changes made inside the guest image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customization {
    pub packages: Vec<String>,
    pub timezone: String,
    pub locale: String,
}

/// Result of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub path: PathBuf,
    /// False when the cached copy was already current
    pub transferred: bool,
    pub bytes: u64,
}

/// Hypervisor control plane, keyed by numeric resource ID.
pub trait ResourceControl {
    /// Whether a VM or template with this ID exists. Read-only.
    fn exists(&self, vmid: u32) -> Result<bool>;

    /// Destroy the resource. A missing resource is not an error.
    fn destroy(&self, vmid: u32) -> Result<()>;

    fn create(&self, spec: &VmSpec) -> Result<()>;

    /// Import `image` as a disk of `vmid`, returning the disk handle.
    fn import_disk(&self, vmid: u32, image: &Path) -> Result<String>;

    fn configure(&self, vmid: u32, spec: &AttachSpec) -> Result<()>;

    /// Grow the primary disk to `size` (e.g. `32G`).
    fn resize(&self, vmid: u32, size: &str) -> Result<()>;

    fn convert_to_template(&self, vmid: u32) -> Result<()>;
}

/// Offline image manipulation on a local file.
pub trait ImageTool {
    /// Strip machine-unique identifiers (machine-id, host keys, logs, ...).
    fn sanitize(&self, image: &Path) -> Result<()>;

    fn customize(&self, image: &Path, customization: &Customization) -> Result<()>;
}

/// Source image transfer into the local cache.
pub trait Fetcher {
    /// Fetch `source` into `dest`, skipping the transfer when `dest` is current.
    fn fetch(&self, source: &Url, dest: &Path) -> Result<FetchOutcome>;
}

/// The collaborators a pipeline run works against.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub control: &'a dyn ResourceControl,
    pub image_tool: &'a dyn ImageTool,
    pub fetcher: &'a dyn Fetcher,
}
