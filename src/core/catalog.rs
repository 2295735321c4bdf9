//! Catalog loading and validation.
//!
//! A catalog is an ordered list of template definitions. In TOML it is a list
//! of `[[image]]` tables; a `.json` file holds a top-level array of objects
//! with the same fields:
//!
//! ```toml
//! [[image]]
//! id = "deb12"
//! label = "Debian 12"
//! vmid = 9000
//! name = "debian-12-template"
//! source = "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2"
//! packages = ["qemu-guest-agent"]
//! checksum = { algorithm = "sha512", digest = "..." }
//! ```
//!
//! Validation is all-or-nothing: every problem in the document is collected
//! and reported together, and a catalog with any problem is never used.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::errors::{CatalogIssue, ForgeError};
use crate::util::context::is_disk_size;
use crate::util::hash::{sha256_file, sha256_str, sha512_file};

/// Selection sentinel; no label may collide with it.
pub const ALL_SENTINEL: &str = "all";

static VMID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("valid vmid pattern"));

/// Digest algorithms accepted in `checksum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Some(ChecksumAlgorithm::Sha256),
            "sha512" => Some(ChecksumAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Length of a hex-encoded digest.
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Sha512 => 128,
        }
    }

    /// Hash a file with this algorithm.
    pub fn digest_file(self, path: &Path) -> anyhow::Result<String> {
        match self {
            ChecksumAlgorithm::Sha256 => sha256_file(path),
            ChecksumAlgorithm::Sha512 => sha512_file(path),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Expected digest of a source image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSpec {
    pub algorithm: ChecksumAlgorithm,
    /// Lowercase hex
    pub digest: String,
}

impl fmt::Display for ChecksumSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

/// A validated template definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDef {
    pub id: String,
    /// Name shown to the operator and used for selection
    pub label: String,
    /// Numeric resource ID on the virtualization host
    pub vmid: u32,
    /// Name given to the VM/template
    pub target_name: String,
    pub source: Url,
    pub packages: Vec<String>,
    pub checksum: Option<ChecksumSpec>,
    pub memory_mb: Option<u32>,
    pub cores: Option<u32>,
    pub disk_size: Option<String>,
}

impl ArtifactDef {
    /// File name of the cached source image.
    ///
    /// Prefixed with a short hash of the full URL so two sources that share a
    /// basename never share a cache entry.
    pub fn cache_file_name(&self) -> String {
        let basename = self
            .source
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("image");
        format!("{}-{}", &sha256_str(self.source.as_str())[..12], basename)
    }
}

/// An ordered, validated catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    path: PathBuf,
    artifacts: Vec<ArtifactDef>,
    by_label: HashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct RawTomlCatalog {
    #[serde(default)]
    image: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawVmid {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawChecksum {
    algorithm: Option<String>,
    digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    id: Option<String>,
    label: Option<String>,
    vmid: Option<RawVmid>,
    name: Option<String>,
    source: Option<String>,
    #[serde(default)]
    packages: Vec<String>,
    checksum: Option<RawChecksum>,
    memory: Option<u32>,
    cores: Option<u32>,
    disk_size: Option<String>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

impl Catalog {
    /// Load and validate a catalog file.
    pub fn load(path: &Path) -> Result<Catalog, ForgeError> {
        let content = std::fs::read_to_string(path).map_err(|e| ForgeError::Validation {
            path: path.to_path_buf(),
            issues: vec![CatalogIssue::document(format!("cannot read file: {}", e))],
        })?;
        Catalog::parse(&content, path)
    }

    /// Parse and validate catalog text; the format follows the file extension.
    pub fn parse(content: &str, path: &Path) -> Result<Catalog, ForgeError> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let raw = if is_json {
            serde_json::from_str::<Vec<RawEntry>>(content).map_err(|e| e.to_string())
        } else {
            toml::from_str::<RawTomlCatalog>(content)
                .map(|c| c.image)
                .map_err(|e| e.to_string())
        };

        let entries = raw.map_err(|reason| ForgeError::Validation {
            path: path.to_path_buf(),
            issues: vec![CatalogIssue::document(reason.trim().to_string())],
        })?;

        let (artifacts, issues) = validate(entries);
        if !issues.is_empty() {
            return Err(ForgeError::Validation {
                path: path.to_path_buf(),
                issues,
            });
        }

        if artifacts.is_empty() {
            tracing::warn!("catalog {} declares no images", path.display());
        }

        let by_label = artifacts
            .iter()
            .enumerate()
            .map(|(i, a)| (a.label.clone(), i))
            .collect();

        Ok(Catalog {
            path: path.to_path_buf(),
            artifacts,
            by_label,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Definitions in declared order.
    pub fn artifacts(&self) -> &[ArtifactDef] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Position of a label in declared order.
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.by_label.get(label).copied()
    }

    pub fn by_label(&self, label: &str) -> Option<&ArtifactDef> {
        self.index_of(label).map(|i| &self.artifacts[i])
    }

    /// Labels in declared order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.artifacts.iter().map(|a| a.label.as_str())
    }
}

fn required(value: Option<String>, field: &str, index: usize, issues: &mut Vec<CatalogIssue>) -> String {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => v,
        _ => {
            issues.push(CatalogIssue::new(index, format!("missing `{}`", field)));
            String::new()
        }
    }
}

fn parse_vmid(raw: Option<RawVmid>, index: usize, issues: &mut Vec<CatalogIssue>) -> Option<u32> {
    let text = match raw {
        None => {
            issues.push(CatalogIssue::new(index, "missing `vmid`"));
            return None;
        }
        Some(RawVmid::Number(n)) => n.to_string(),
        Some(RawVmid::Text(s)) => s.trim().to_string(),
    };

    if !VMID_PATTERN.is_match(&text) {
        issues.push(CatalogIssue::new(
            index,
            format!("`vmid` must be a positive integer, got `{}`", text),
        ));
        return None;
    }

    match text.parse::<u32>() {
        Ok(0) => {
            issues.push(CatalogIssue::new(index, "`vmid` must be greater than zero"));
            None
        }
        Ok(vmid) => Some(vmid),
        Err(_) => {
            issues.push(CatalogIssue::new(
                index,
                format!("`vmid` {} is out of range", text),
            ));
            None
        }
    }
}

fn parse_source(raw: &str, index: usize, issues: &mut Vec<CatalogIssue>) -> Option<Url> {
    if raw.is_empty() {
        return None;
    }
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https" | "file") => Some(url),
        Ok(url) => {
            issues.push(CatalogIssue::new(
                index,
                format!("unsupported `source` scheme `{}`", url.scheme()),
            ));
            None
        }
        Err(e) => {
            issues.push(CatalogIssue::new(
                index,
                format!("`source` is not a valid URL: {}", e),
            ));
            None
        }
    }
}

fn parse_checksum(
    raw: Option<RawChecksum>,
    index: usize,
    issues: &mut Vec<CatalogIssue>,
) -> Option<ChecksumSpec> {
    let raw = raw?;
    let algorithm = match raw.algorithm.as_deref().map(ChecksumAlgorithm::parse) {
        Some(Some(algorithm)) => algorithm,
        Some(None) => {
            issues.push(CatalogIssue::new(
                index,
                "`checksum.algorithm` must be `sha256` or `sha512`",
            ));
            return None;
        }
        None => {
            issues.push(CatalogIssue::new(index, "missing `checksum.algorithm`"));
            return None;
        }
    };

    let digest = raw.digest.unwrap_or_default().trim().to_ascii_lowercase();
    if digest.len() != algorithm.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        issues.push(CatalogIssue::new(
            index,
            format!(
                "`checksum.digest` must be {} hex characters for {}",
                algorithm.hex_len(),
                algorithm
            ),
        ));
        return None;
    }

    Some(ChecksumSpec { algorithm, digest })
}

/// Validate raw entries, returning the definitions and every problem found.
fn validate(entries: Vec<RawEntry>) -> (Vec<ArtifactDef>, Vec<CatalogIssue>) {
    let mut issues = Vec::new();
    let mut artifacts = Vec::new();
    let mut seen_ids: HashMap<String, usize> = HashMap::new();
    let mut seen_labels: HashMap<String, usize> = HashMap::new();
    let mut seen_vmids: HashMap<u32, usize> = HashMap::new();

    for (index, raw) in entries.into_iter().enumerate() {
        let issues_before = issues.len();

        for key in raw.unknown.keys() {
            issues.push(CatalogIssue::new(index, format!("unknown field `{}`", key)));
        }

        let id = required(raw.id, "id", index, &mut issues);
        let vmid = parse_vmid(raw.vmid, index, &mut issues);
        let target_name = required(raw.name, "name", index, &mut issues);
        let source_text = required(raw.source, "source", index, &mut issues);
        let source = parse_source(&source_text, index, &mut issues);
        let checksum = parse_checksum(raw.checksum, index, &mut issues);

        let label = raw
            .label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| id.clone());
        if label.eq_ignore_ascii_case(ALL_SENTINEL) {
            issues.push(CatalogIssue::new(
                index,
                format!("label `{}` is reserved", label),
            ));
        }

        for package in &raw.packages {
            if package.trim().is_empty() || package.contains([',', ' ']) {
                issues.push(CatalogIssue::new(
                    index,
                    format!("invalid package name `{}`", package),
                ));
            }
        }

        if raw.memory == Some(0) || raw.cores == Some(0) {
            issues.push(CatalogIssue::new(
                index,
                "`memory` and `cores` must be greater than zero",
            ));
        }
        if let Some(size) = raw.disk_size.as_deref() {
            if !is_disk_size(size) {
                issues.push(CatalogIssue::new(
                    index,
                    format!("`disk_size` `{}` is not a size like `32G`", size),
                ));
            }
        }

        if !id.is_empty() {
            if let Some(first) = seen_ids.insert(id.clone(), index) {
                issues.push(CatalogIssue::new(
                    index,
                    format!("duplicate id `{}` (first used by image[{}])", id, first),
                ));
            }
        }
        if !label.is_empty() {
            if let Some(first) = seen_labels.insert(label.clone(), index) {
                issues.push(CatalogIssue::new(
                    index,
                    format!("duplicate label `{}` (first used by image[{}])", label, first),
                ));
            }
        }
        if let Some(vmid) = vmid {
            if let Some(first) = seen_vmids.insert(vmid, index) {
                issues.push(CatalogIssue::new(
                    index,
                    format!("duplicate vmid {} (first used by image[{}])", vmid, first),
                ));
            }
        }

        if issues.len() > issues_before {
            continue;
        }

        // No new issues implies every required field parsed.
        if let (Some(vmid), Some(source)) = (vmid, source) {
            artifacts.push(ArtifactDef {
                id,
                label,
                vmid,
                target_name,
                source,
                packages: raw.packages,
                checksum,
                memory_mb: raw.memory,
                cores: raw.cores,
                disk_size: raw.disk_size,
            });
        }
    }

    (artifacts, issues)
}
