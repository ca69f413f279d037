//! Emulator control
//!
//! The scenario never builds emulator command lines itself. It hands a
//! [`LaunchRequest`] of resolved paths to a [`VmController`] and drives the
//! returned [`VmHandle`].

mod qemu;

pub use qemu::{QemuController, QemuHandle};

use std::path::PathBuf;

use async_trait::async_trait;

use crate::common::Result;
use crate::console::ConsoleTransport;

/// Everything needed to boot a guest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    /// Full kernel command line, prefix already applied
    pub command_line: Option<String>,
    /// Device, network or machine arguments, passed through verbatim
    pub args: Vec<String>,
}

/// How the emulator process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmExit {
    /// `None` when killed by a signal
    pub code: Option<i32>,
}

impl VmExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for VmExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

#[async_trait]
pub trait VmController: Send + Sync {
    /// Start a guest; the handle owns the process from here on
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn VmHandle>>;
}

#[async_trait]
pub trait VmHandle: Send {
    /// The serial console stream; only the first call returns it
    fn take_console(&mut self) -> Option<ConsoleTransport>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<VmExit>;

    /// Exit status if the process has already ended
    fn try_wait(&mut self) -> Result<Option<VmExit>>;

    /// Force the process down and reap it
    async fn terminate(&mut self) -> Result<VmExit>;
}
