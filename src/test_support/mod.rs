//! Test utilities for imgforge unit tests.
//!
//! [`FakeBackend`] implements all three collaborator traits in memory and
//! records every call, so tests can assert on exactly what the pipeline asked
//! the outside world to do. Failures and timeouts can be injected per
//! operation.
//!
//! # Example
//!
//! ```rust,ignore
//! use imgforge::test_support::{fixtures, FakeBackend};
//!
//! let backend = FakeBackend::new();
//! backend.fail_on("import_disk");
//! // hand backend.collaborators() to a Pipeline ...
//! assert_eq!(backend.count("configure"), 0);
//! ```

pub mod fixtures;

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use url::Url;

use crate::backend::{
    AttachSpec, Collaborators, Customization, FetchOutcome, Fetcher, ImageTool, ResourceControl,
    VmSpec,
};
use crate::util::process::ProcessTimeout;

pub use fixtures::*;

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Exists(u32),
    Destroy(u32),
    Create(VmSpec),
    ImportDisk(u32, PathBuf),
    Configure(u32, AttachSpec),
    Resize(u32, String),
    Template(u32),
    Sanitize(PathBuf),
    Customize(PathBuf, Customization),
    Fetch(Url),
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Exists(_) => "exists",
            Call::Destroy(_) => "destroy",
            Call::Create(_) => "create",
            Call::ImportDisk(..) => "import_disk",
            Call::Configure(..) => "configure",
            Call::Resize(..) => "resize",
            Call::Template(_) => "convert_to_template",
            Call::Sanitize(_) => "sanitize",
            Call::Customize(..) => "customize",
            Call::Fetch(_) => "fetch",
        }
    }

    /// Everything except the existence query changes something.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Call::Exists(_))
    }
}

/// In-memory hypervisor, image tool and fetcher.
#[derive(Debug, Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<Call>>,
    live: Mutex<BTreeSet<u32>>,
    fail_on: Mutex<HashSet<String>>,
    time_out_on: Mutex<HashSet<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        FakeBackend::default()
    }

    /// Borrow this fake as every collaborator of a pipeline.
    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            control: self,
            image_tool: self,
            fetcher: self,
        }
    }

    /// Make the named operation fail from now on.
    pub fn fail_on(&self, operation: &str) {
        self.fail_on.lock().unwrap().insert(operation.to_string());
    }

    /// Make the named operation exceed its deadline from now on.
    pub fn time_out_on(&self, operation: &str) {
        self.time_out_on.lock().unwrap().insert(operation.to_string());
    }

    /// Pretend a resource already exists on the host.
    pub fn add_live(&self, vmid: u32) {
        self.live.lock().unwrap().insert(vmid);
    }

    pub fn is_live(&self, vmid: u32) -> bool {
        self.live.lock().unwrap().contains(&vmid)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(Call::name).collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.name() == operation)
            .count()
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(Call::is_mutating)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Bytes the fake fetcher writes for `source`.
    pub fn image_bytes(&self, source: &Url) -> Vec<u8> {
        format!("fake disk image from {}", source).into_bytes()
    }

    fn record(&self, call: Call) -> Result<()> {
        let name = call.name();
        self.calls.lock().unwrap().push(call);

        if self.time_out_on.lock().unwrap().contains(name) {
            return Err(ProcessTimeout {
                command: format!("fake {}", name),
                timeout: Duration::from_secs(1),
            }
            .into());
        }
        if self.fail_on.lock().unwrap().contains(name) {
            bail!("injected failure in {}", name);
        }
        Ok(())
    }
}

impl ResourceControl for FakeBackend {
    fn exists(&self, vmid: u32) -> Result<bool> {
        self.record(Call::Exists(vmid))?;
        Ok(self.is_live(vmid))
    }

    fn destroy(&self, vmid: u32) -> Result<()> {
        self.record(Call::Destroy(vmid))?;
        self.live.lock().unwrap().remove(&vmid);
        Ok(())
    }

    fn create(&self, spec: &VmSpec) -> Result<()> {
        self.record(Call::Create(spec.clone()))?;
        if !self.live.lock().unwrap().insert(spec.vmid) {
            bail!("VM {} already exists", spec.vmid);
        }
        Ok(())
    }

    fn import_disk(&self, vmid: u32, image: &Path) -> Result<String> {
        self.record(Call::ImportDisk(vmid, image.to_path_buf()))?;
        if !image.exists() {
            bail!("image {} does not exist", image.display());
        }
        Ok(format!("local-lvm:vm-{}-disk-0", vmid))
    }

    fn configure(&self, vmid: u32, spec: &AttachSpec) -> Result<()> {
        self.record(Call::Configure(vmid, spec.clone()))
    }

    fn resize(&self, vmid: u32, size: &str) -> Result<()> {
        self.record(Call::Resize(vmid, size.to_string()))
    }

    fn convert_to_template(&self, vmid: u32) -> Result<()> {
        self.record(Call::Template(vmid))
    }
}

impl ImageTool for FakeBackend {
    fn sanitize(&self, image: &Path) -> Result<()> {
        self.record(Call::Sanitize(image.to_path_buf()))
    }

    fn customize(&self, image: &Path, customization: &Customization) -> Result<()> {
        self.record(Call::Customize(image.to_path_buf(), customization.clone()))
    }
}

impl Fetcher for FakeBackend {
    /// Writes [`FakeBackend::image_bytes`] unless `dest` is already cached.
    fn fetch(&self, source: &Url, dest: &Path) -> Result<FetchOutcome> {
        self.record(Call::Fetch(source.clone()))?;

        if dest.exists() {
            return Ok(FetchOutcome {
                path: dest.to_path_buf(),
                transferred: false,
                bytes: std::fs::metadata(dest)?.len(),
            });
        }

        let bytes = self.image_bytes(source);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, &bytes)?;
        Ok(FetchOutcome {
            path: dest.to_path_buf(),
            transferred: true,
            bytes: bytes.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_records_and_fails() {
        let backend = FakeBackend::new();
        backend.add_live(100);
        assert!(backend.exists(100).unwrap());
        backend.destroy(100).unwrap();
        assert!(!backend.exists(100).unwrap());

        backend.fail_on("resize");
        assert!(backend.resize(100, "32G").is_err());
        assert_eq!(backend.call_names(), ["exists", "destroy", "exists", "resize"]);
        assert_eq!(backend.mutating_calls().len(), 2);
    }
}
