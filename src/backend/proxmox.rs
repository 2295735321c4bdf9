//! Proxmox VE control plane via the `qm` command.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;

use super::{AttachSpec, ResourceControl, VmSpec};
use crate::util::process::ProcessBuilder;

/// `qm importdisk` reports the new volume on its last line.
static IMPORTED_DISK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Successfully imported disk as '(?:unused\d+:)?([^']+)'")
        .expect("valid importdisk pattern")
});

/// Drives `qm` on the local Proxmox node.
#[derive(Debug, Clone)]
pub struct QmControl {
    qm: PathBuf,
    storage: String,
    timeout: Duration,
}

impl QmControl {
    pub fn new(qm: impl Into<PathBuf>, storage: impl Into<String>, timeout: Duration) -> Self {
        QmControl {
            qm: qm.into(),
            storage: storage.into(),
            timeout,
        }
    }

    fn qm(&self) -> ProcessBuilder {
        ProcessBuilder::new(&self.qm).timeout(self.timeout)
    }

    fn run(&self, cmd: ProcessBuilder) -> Result<Output> {
        let display = cmd.display_command();
        cmd.exec_and_check()
            .with_context(|| format!("`{}` failed", display))
    }
}

fn missing_resource(output: &Output) -> bool {
    !output.status.success() && String::from_utf8_lossy(&output.stderr).contains("does not exist")
}

/// Extract the disk handle from `qm importdisk` output.
pub fn parse_imported_disk(stdout: &str) -> Option<String> {
    IMPORTED_DISK
        .captures_iter(stdout)
        .last()
        .map(|caps| caps[1].to_string())
}

impl ResourceControl for QmControl {
    fn exists(&self, vmid: u32) -> Result<bool> {
        let cmd = self.qm().arg("status").arg(vmid.to_string());
        let output = cmd.exec()?;
        if output.status.success() {
            return Ok(true);
        }
        if missing_resource(&output) {
            return Ok(false);
        }
        bail!(
            "`{}` failed with exit code {:?}\n{}",
            cmd.display_command(),
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim_end()
        )
    }

    fn destroy(&self, vmid: u32) -> Result<()> {
        if !self.exists(vmid)? {
            tracing::info!("no existing resource {}, nothing to destroy", vmid);
            return Ok(());
        }

        tracing::info!("destroying existing resource {}", vmid);
        let id = vmid.to_string();
        let cmd = self.qm().args(["destroy", id.as_str(), "--purge"]);
        let output = cmd.exec()?;
        if output.status.success() || missing_resource(&output) {
            return Ok(());
        }
        bail!(
            "`{}` failed with exit code {:?}\n{}",
            cmd.display_command(),
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim_end()
        )
    }

    fn create(&self, spec: &VmSpec) -> Result<()> {
        tracing::info!(
            "creating VM {} `{}` ({} MiB, {} cores)",
            spec.vmid,
            spec.name,
            spec.memory_mb,
            spec.cores
        );
        self.run(self.qm().args([
            "create".to_string(),
            spec.vmid.to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--memory".to_string(),
            spec.memory_mb.to_string(),
            "--cores".to_string(),
            spec.cores.to_string(),
            "--net0".to_string(),
            format!("virtio,bridge={}", spec.bridge),
        ]))?;
        Ok(())
    }

    fn import_disk(&self, vmid: u32, image: &Path) -> Result<String> {
        tracing::info!("importing {} into {} for {}", image.display(), self.storage, vmid);
        let output = self.run(
            self.qm()
                .arg("importdisk")
                .arg(vmid.to_string())
                .arg(image)
                .arg(&self.storage),
        )?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_imported_disk(&stdout).unwrap_or_else(|| {
            let fallback = format!("{}:vm-{}-disk-0", self.storage, vmid);
            tracing::warn!("could not read imported disk name, assuming {}", fallback);
            fallback
        }))
    }

    fn configure(&self, vmid: u32, spec: &AttachSpec) -> Result<()> {
        tracing::info!("configuring hardware and cloud-init for {}", vmid);

        let cloudinit = format!("{}:cloudinit", self.storage);
        let mut cmd = self
            .qm()
            .arg("set")
            .arg(vmid.to_string())
            .args(["--scsihw", spec.scsihw.as_str()])
            .args(["--scsi0", spec.disk.as_str()])
            .args(["--ide2", cloudinit.as_str()])
            .args(["--boot", "c", "--bootdisk", "scsi0"])
            .args(["--ipconfig0", spec.ipconfig.as_str()]);

        if spec.serial_console {
            cmd = cmd.args(["--serial0", "socket", "--vga", "serial0"]);
        }
        if spec.guest_agent {
            cmd = cmd.args(["--agent", "enabled=1"]);
        }
        if let Some(user) = &spec.ci_user {
            cmd = cmd.args(["--ciuser", user.as_str()]);
        }
        if let Some(keys) = &spec.ssh_keys_file {
            cmd = cmd.arg("--sshkeys").arg(keys);
        }
        if let Some(password) = &spec.password_hash {
            cmd = cmd.arg("--cipassword").secret_arg(password.expose());
        }
        if let Some(nameserver) = &spec.nameserver {
            cmd = cmd.args(["--nameserver", nameserver.as_str()]);
        }
        if let Some(searchdomain) = &spec.searchdomain {
            cmd = cmd.args(["--searchdomain", searchdomain.as_str()]);
        }

        self.run(cmd)?;
        Ok(())
    }

    fn resize(&self, vmid: u32, size: &str) -> Result<()> {
        tracing::info!("resizing scsi0 of {} to {}", vmid, size);
        let id = vmid.to_string();
        self.run(self.qm().args(["resize", id.as_str(), "scsi0", size]))?;
        Ok(())
    }

    fn convert_to_template(&self, vmid: u32) -> Result<()> {
        tracing::info!("converting {} to a template", vmid);
        self.run(self.qm().arg("template").arg(vmid.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_imported_disk() {
        let stdout = "importing disk 'debian.qcow2' to VM 9000 ...\n\
                      transferred 2.0 GiB of 2.0 GiB (100.00%)\n\
                      Successfully imported disk as 'unused0:local-lvm:vm-9000-disk-0'\n";
        assert_eq!(
            parse_imported_disk(stdout).as_deref(),
            Some("local-lvm:vm-9000-disk-0")
        );
        assert_eq!(parse_imported_disk("no disk here"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_exists_reads_exit_status() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("qm");
        std::fs::write(
            &script,
            "#!/bin/sh\nif [ \"$2\" = \"9000\" ]; then echo 'status: stopped'; exit 0; fi\n\
             echo \"Configuration file 'nodes/pve/qemu-server/$2.conf' does not exist\" >&2\nexit 2\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let qm = QmControl::new(&script, "local-lvm", Duration::from_secs(10));
        assert!(qm.exists(9000).unwrap());
        assert!(!qm.exists(9001).unwrap());
        // Destroying an absent resource is not an error.
        qm.destroy(9001).unwrap();
    }
}
