//! Offline image changes with libguestfs (`virt-sysprep`, `virt-customize`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use super::{Customization, ImageTool};
use crate::util::process::ProcessBuilder;

/// `virt-sysprep` operations that remove per-machine identity.
pub const SYSPREP_OPERATIONS: &str =
    "machine-id,ssh-hostkeys,logfiles,tmp-files,bash-history,net-hwaddr,dhcp-client-state";

#[derive(Debug, Clone)]
pub struct GuestfsTool {
    virt_sysprep: PathBuf,
    virt_customize: PathBuf,
    timeout: Duration,
}

impl GuestfsTool {
    pub fn new(
        virt_sysprep: impl Into<PathBuf>,
        virt_customize: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        GuestfsTool {
            virt_sysprep: virt_sysprep.into(),
            virt_customize: virt_customize.into(),
            timeout,
        }
    }

    /// Arguments for `virt-customize`, excluding the program.
    pub fn customize_args(image: &Path, customization: &Customization) -> Vec<String> {
        let mut args = vec!["-a".to_string(), image.display().to_string()];
        if !customization.packages.is_empty() {
            args.push("--install".to_string());
            args.push(customization.packages.join(","));
        }
        args.push("--timezone".to_string());
        args.push(customization.timezone.clone());
        args.push("--write".to_string());
        args.push(format!("/etc/locale.conf:LANG={}", customization.locale));
        args
    }
}

impl ImageTool for GuestfsTool {
    fn sanitize(&self, image: &Path) -> Result<()> {
        tracing::info!("sanitizing {}", image.display());
        let cmd = ProcessBuilder::new(&self.virt_sysprep)
            .timeout(self.timeout)
            .arg("-a")
            .arg(image)
            .args(["--operations", SYSPREP_OPERATIONS]);
        let display = cmd.display_command();
        cmd.exec_and_check()
            .with_context(|| format!("`{}` failed", display))?;
        Ok(())
    }

    fn customize(&self, image: &Path, customization: &Customization) -> Result<()> {
        tracing::info!(
            "customizing {} ({} package(s), timezone {}, locale {})",
            image.display(),
            customization.packages.len(),
            customization.timezone,
            customization.locale
        );
        let cmd = ProcessBuilder::new(&self.virt_customize)
            .timeout(self.timeout)
            .args(Self::customize_args(image, customization));
        let display = cmd.display_command();
        cmd.exec_and_check()
            .with_context(|| format!("`{}` failed", display))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_customize_args() {
        let customization = Customization {
            packages: vec!["qemu-guest-agent".to_string(), "curl".to_string()],
            timezone: "Europe/Berlin".to_string(),
            locale: "de_DE.UTF-8".to_string(),
        };
        let args = GuestfsTool::customize_args(Path::new("/tmp/work/disk.img"), &customization);
        assert_eq!(
            args,
            [
                "-a",
                "/tmp/work/disk.img",
                "--install",
                "qemu-guest-agent,curl",
                "--timezone",
                "Europe/Berlin",
                "--write",
                "/etc/locale.conf:LANG=de_DE.UTF-8",
            ]
        );
    }

    #[test]
    fn test_no_packages_skips_install() {
        let customization = Customization {
            packages: Vec::new(),
            timezone: "UTC".to_string(),
            locale: "C.UTF-8".to_string(),
        };
        let args = GuestfsTool::customize_args(Path::new("disk.img"), &customization);
        assert!(!args.contains(&"--install".to_string()));
    }

    #[test]
    fn test_missing_tool_is_an_error() {
        let tool = GuestfsTool::new(
            "/nonexistent/virt-sysprep",
            "/nonexistent/virt-customize",
            Duration::from_secs(5),
        );
        assert!(tool.sanitize(Path::new("disk.img")).is_err());
    }
}
