//! Build signatures for change tracking.
//!
//! A signature captures every input that shapes a template: the source image
//! (locator and mtime), the packages and checksum, the toggles and resource
//! parameters, the customization settings, and one-way hashes of credential
//! material. Two runs with the same signature and a live resource produce the
//! same template, so the second one can be skipped.
//!
//! The digest is SHA-256 over canonical JSON (object keys sorted), which makes
//! it independent of field order and stable across restarts.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::catalog::ArtifactDef;
use crate::util::context::{Secret, Settings};
use crate::util::hash::sha256_canonical_json;

/// Resolved inputs of one artifact build.
///
/// Resolved immediately before the signature is computed, so the source
/// mtime is the one the build is about to use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureInputs {
    /// `None` when the source has not been fetched yet (dry-run)
    pub source_mtime: Option<u64>,
    pub source: String,
    pub target_name: String,
    pub packages: Vec<String>,
    /// Textual checksum spec, `algorithm:digest`
    pub checksum: Option<String>,

    pub sanitize: bool,
    pub guest_agent: bool,
    pub serial_console: bool,

    pub memory_mb: u32,
    pub cores: u32,
    pub disk_size: String,
    pub bridge: String,
    pub storage: String,
    pub scsihw: String,

    pub timezone: String,
    pub locale: String,
    pub ci_user: Option<String>,
    pub nameserver: Option<String>,
    pub searchdomain: Option<String>,
    pub ipconfig: String,

    /// sha256 of the password hash; `None` when no password is configured
    pub password_digest: Option<String>,
    /// sha256 of the SSH public keys; `None` when no keys are configured
    pub ssh_keys_digest: Option<String>,
}

impl SignatureInputs {
    /// Collect the inputs for `artifact` under `settings`.
    pub fn resolve(artifact: &ArtifactDef, settings: &Settings, source_mtime: Option<u64>) -> Self {
        let host = &settings.host;
        let image = &settings.image;
        let ci = &settings.cloud_init;

        SignatureInputs {
            source_mtime,
            source: artifact.source.to_string(),
            target_name: artifact.target_name.clone(),
            packages: artifact.packages.clone(),
            checksum: artifact.checksum.as_ref().map(|c| c.to_string()),
            sanitize: image.sanitize,
            guest_agent: image.guest_agent,
            serial_console: image.serial_console,
            memory_mb: artifact.memory_mb.unwrap_or(host.memory_mb),
            cores: artifact.cores.unwrap_or(host.cores),
            disk_size: artifact
                .disk_size
                .clone()
                .unwrap_or_else(|| host.disk_size.clone()),
            bridge: host.bridge.clone(),
            storage: host.storage.clone(),
            scsihw: host.scsihw.clone(),
            timezone: image.timezone.clone(),
            locale: image.locale.clone(),
            ci_user: ci.user.clone(),
            nameserver: ci.nameserver.clone(),
            searchdomain: ci.searchdomain.clone(),
            ipconfig: ci.ipconfig.clone(),
            password_digest: ci.password_hash.as_ref().map(Secret::digest),
            ssh_keys_digest: ci.ssh_keys.as_ref().map(Secret::digest),
        }
    }
}

/// Compute the signature digest of resolved inputs.
pub fn compute_signature(inputs: &SignatureInputs) -> Result<String> {
    let value = serde_json::to_value(inputs).context("failed to serialize signature inputs")?;
    sha256_canonical_json(&value)
}
