//! QEMU-style emulator launched as a child process
//!
//! The guest console is the child's stdin/stdout (`-serial stdio`).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::{LaunchRequest, VmController, VmExit, VmHandle};
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::console::ConsoleTransport;

/// Arguments that route the serial console to stdio and disable everything
/// that would want a display or monitor
const HEADLESS_ARGS: &[&str] = &[
    "-display", "none", "-vga", "none", "-serial", "stdio", "-monitor", "none",
];

/// Launches an emulator binary per scenario
#[derive(Debug, Clone)]
pub struct QemuController {
    binary: PathBuf,
    base_args: Vec<String>,
}

impl QemuController {
    pub fn new(binary: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            base_args,
        }
    }

    /// Use `vm.binary` (resolved on PATH) and `vm.args`
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.vm_binary()?, config.vm.args.clone()))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Full argument list for `request`
    pub fn build_args(&self, request: &LaunchRequest) -> Vec<String> {
        let mut args = self.base_args.clone();
        if let Some(kernel) = &request.kernel {
            args.push("-kernel".to_string());
            args.push(kernel.display().to_string());
        }
        if let Some(initrd) = &request.initrd {
            args.push("-initrd".to_string());
            args.push(initrd.display().to_string());
        }
        if let Some(command_line) = &request.command_line {
            args.push("-append".to_string());
            args.push(command_line.clone());
        }
        args.extend(HEADLESS_ARGS.iter().map(|s| s.to_string()));
        args.extend(request.args.iter().cloned());
        args
    }
}

#[async_trait]
impl VmController for QemuController {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn VmHandle>> {
        let args = self.build_args(request);
        tracing::info!(binary = %self.binary.display(), ?args, "Launching VM");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::ProcessLaunch(format!("Failed to start {}: {}", self.binary.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ProcessLaunch("Failed to get VM stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProcessLaunch("Failed to get VM stdout".to_string()))?;

        tracing::debug!(pid = child.id(), "VM started");
        Ok(Box::new(QemuHandle {
            child,
            console: Some(ConsoleTransport::new(stdout, stdin)),
        }))
    }
}

/// A running emulator process
pub struct QemuHandle {
    child: Child,
    console: Option<ConsoleTransport>,
}

fn to_exit(status: std::process::ExitStatus) -> VmExit {
    VmExit {
        code: status.code(),
    }
}

#[async_trait]
impl VmHandle for QemuHandle {
    fn take_console(&mut self) -> Option<ConsoleTransport> {
        self.console.take()
    }

    async fn wait(&mut self) -> Result<VmExit> {
        let status = self.child.wait().await?;
        tracing::debug!(?status, "VM exited");
        Ok(to_exit(status))
    }

    fn try_wait(&mut self) -> Result<Option<VmExit>> {
        Ok(self.child.try_wait()?.map(to_exit))
    }

    async fn terminate(&mut self) -> Result<VmExit> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(to_exit(status));
        }
        tracing::debug!(pid = self.child.id(), "Killing VM");
        if let Err(e) = self.child.kill().await {
            // Raced with a natural exit
            if let Some(status) = self.child.try_wait()? {
                return Ok(to_exit(status));
            }
            return Err(e.into());
        }
        Ok(to_exit(self.child.wait().await?))
    }
}

impl Drop for QemuHandle {
    fn drop(&mut self) {
        // Best effort; kill_on_drop covers the rest
        let _ = self.child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_order() {
        let controller = QemuController::new("qemu-system-mips", vec!["-M".into(), "malta".into()]);
        let args = controller.build_args(&LaunchRequest {
            kernel: Some(PathBuf::from("/cache/vmlinux")),
            initrd: Some(PathBuf::from("/cache/rootfs.cpio")),
            command_line: Some("printk.time=0 console=ttyS0".to_string()),
            args: vec!["-m".into(), "64".into()],
        });

        assert_eq!(
            args,
            vec![
                "-M",
                "malta",
                "-kernel",
                "/cache/vmlinux",
                "-initrd",
                "/cache/rootfs.cpio",
                "-append",
                "printk.time=0 console=ttyS0",
                "-display",
                "none",
                "-vga",
                "none",
                "-serial",
                "stdio",
                "-monitor",
                "none",
                "-m",
                "64",
            ]
        );
    }

    #[test]
    fn test_optional_parts_are_omitted() {
        let controller = QemuController::new("qemu", Vec::new());
        let args = controller.build_args(&LaunchRequest::default());
        assert!(!args.contains(&"-kernel".to_string()));
        assert!(!args.contains(&"-append".to_string()));
        assert!(args.contains(&"stdio".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_failure() {
        let controller = QemuController::new("/nonexistent/qemu-system-mips", Vec::new());
        let err = controller
            .launch(&LaunchRequest::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ProcessLaunch(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_and_terminate() {
        // `sh` ignores the emulator flags after `-c`
        let controller = QemuController::new("sh", vec!["-c".into(), "exit 7".into()]);
        let mut handle = controller.launch(&LaunchRequest::default()).await.unwrap();
        assert!(handle.take_console().is_some());
        assert!(handle.take_console().is_none());
        assert_eq!(handle.wait().await.unwrap().code, Some(7));
        // Terminating an exited process just reports its status
        assert_eq!(handle.terminate().await.unwrap().code, Some(7));

        let controller = QemuController::new("sh", vec!["-c".into(), "sleep 30".into()]);
        let mut handle = controller.launch(&LaunchRequest::default()).await.unwrap();
        assert_eq!(handle.try_wait().unwrap(), None);
        let exit = handle.terminate().await.unwrap();
        assert!(!exit.success());
    }
}
