//! Fail-fast scenario execution
//!
//! A scenario is an ordered list of steps run on one task. The first failing
//! step stops the run; the VM and console are released on every path out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use crate::archive::ArchiveExtractor;
use crate::assets::{AssetDescriptor, AssetStore};
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::console::{CommandRunner, ConsoleSession, Match, Pattern, SessionOptions};
use crate::vm::{LaunchRequest, VmController, VmExit, VmHandle};

/// How long to wait for the process after the console hits EOF
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum ScenarioStep {
    /// Fetch an asset and bind its verified path
    FetchAsset {
        asset: AssetDescriptor,
        bind: String,
        /// Bind the decompressed content of a gzip/xz asset instead
        uncompress: bool,
    },
    /// Fetch an archive and bind one extracted member
    ExtractMember {
        asset: AssetDescriptor,
        member: String,
        bind: String,
    },
    /// Boot the guest; `kernel` and `initrd` name earlier bindings
    LaunchVm {
        kernel: Option<String>,
        initrd: Option<String>,
        command_line: Option<String>,
        /// Skip the common command-line prefix
        raw_command_line: bool,
        args: Vec<String>,
    },
    WaitForPattern {
        pattern: Pattern,
    },
    ExecAndWait {
        command: String,
        pattern: Pattern,
    },
    /// Send a shutdown command and wait for the process to exit
    ShutdownAndWait {
        command: String,
        pattern: Option<Pattern>,
        timeout: Duration,
    },
}

impl ScenarioStep {
    /// One-line summary for progress output
    pub fn describe(&self) -> String {
        match self {
            Self::FetchAsset {
                asset,
                bind,
                uncompress,
            } => {
                let verb = if *uncompress { "fetch+uncompress" } else { "fetch" };
                format!("{} {} as {{{}}}", verb, asset.file_name(), bind)
            }
            Self::ExtractMember {
                asset,
                member,
                bind,
            } => format!("extract {} from {} as {{{}}}", member, asset.file_name(), bind),
            Self::LaunchVm { command_line, .. } => match command_line {
                Some(cl) => format!("launch VM ({})", cl),
                None => "launch VM".to_string(),
            },
            Self::WaitForPattern { pattern } => format!("wait for '{}'", pattern.text),
            Self::ExecAndWait { command, pattern } => {
                format!("run '{}' and wait for '{}'", command, pattern.text)
            }
            Self::ShutdownAndWait { command, .. } => format!("shut down with '{}'", command),
        }
    }
}

/// Shared collaborators and settings for running scenarios
pub struct ScenarioContext<'a> {
    pub store: &'a AssetStore,
    pub extractor: &'a ArchiveExtractor,
    pub controller: &'a dyn VmController,
    pub session: SessionOptions,
    pub line_terminator: String,
    /// Prefix added to every kernel command line
    pub common_command_line: String,
    /// Raw console logs go here, one file per scenario
    pub console_log_dir: Option<PathBuf>,
}

impl<'a> ScenarioContext<'a> {
    pub fn new(
        store: &'a AssetStore,
        extractor: &'a ArchiveExtractor,
        controller: &'a dyn VmController,
        config: &Config,
    ) -> Self {
        Self {
            store,
            extractor,
            controller,
            session: SessionOptions::from_config(config),
            line_terminator: config.console.line_terminator.clone(),
            common_command_line: config.kernel.common_command_line.clone(),
            console_log_dir: config.console.log_dir.clone(),
        }
    }
}

#[derive(Debug)]
pub enum ScenarioOutcome {
    Success {
        steps_run: usize,
    },
    Failure {
        /// 0-based index of the failing step
        step_index: usize,
        error: Error,
        console_tail: Option<String>,
        exit_code: Option<i32>,
    },
}

impl ScenarioOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: ScenarioStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Run every step in order, stopping at the first failure
    pub async fn run(&self, ctx: &ScenarioContext<'_>) -> ScenarioOutcome {
        self.run_with(ctx, |_, _| {}).await
    }

    /// Like [`run`](Self::run), reporting each step before it starts
    pub async fn run_with<F>(&self, ctx: &ScenarioContext<'_>, mut on_step: F) -> ScenarioOutcome
    where
        F: FnMut(usize, &ScenarioStep),
    {
        let mut exec = Execution::new(ctx, &self.name);
        let mut failure = None;

        for (index, step) in self.steps.iter().enumerate() {
            on_step(index, step);
            tracing::info!(scenario = %self.name, step = index + 1, "{}", step.describe());
            if let Err(error) = exec.run_step(step).await {
                let error = exec.diagnose(error).await;
                tracing::warn!(scenario = %self.name, step = index + 1, category = error.category(), "Step failed: {}", error);
                failure = Some((index, error));
                break;
            }
        }

        let buffered_tail = exec.console.as_ref().map(ConsoleSession::tail);
        exec.teardown().await;

        match failure {
            None => ScenarioOutcome::Success {
                steps_run: self.steps.len(),
            },
            Some((step_index, error)) => ScenarioOutcome::Failure {
                step_index,
                console_tail: error.console_tail().map(str::to_string).or(buffered_tail),
                exit_code: exec.exit.and_then(|exit| exit.code),
                error,
            },
        }
    }
}

/// Per-run state; owned by exactly one scenario run
struct Execution<'a> {
    ctx: &'a ScenarioContext<'a>,
    name: &'a str,
    bindings: HashMap<String, PathBuf>,
    scratch: Option<TempDir>,
    vm: Option<Box<dyn VmHandle>>,
    console: Option<ConsoleSession>,
    command_line: Option<String>,
    exit: Option<VmExit>,
}

impl<'a> Execution<'a> {
    fn new(ctx: &'a ScenarioContext<'a>, name: &'a str) -> Self {
        Self {
            ctx,
            name,
            bindings: HashMap::new(),
            scratch: None,
            vm: None,
            console: None,
            command_line: None,
            exit: None,
        }
    }

    async fn run_step(&mut self, step: &ScenarioStep) -> Result<()> {
        match step {
            ScenarioStep::FetchAsset {
                asset,
                bind,
                uncompress,
            } => {
                let mut path = self.ctx.store.fetch(asset).await?;
                if *uncompress {
                    path = self.ctx.extractor.uncompress(&path).await?;
                }
                self.bindings.insert(bind.clone(), path);
                Ok(())
            }
            ScenarioStep::ExtractMember {
                asset,
                member,
                bind,
            } => {
                let handle = self
                    .ctx
                    .extractor
                    .extract_asset(self.ctx.store, asset, member)
                    .await?;
                self.bindings.insert(bind.clone(), handle.path);
                Ok(())
            }
            ScenarioStep::LaunchVm {
                kernel,
                initrd,
                command_line,
                raw_command_line,
                args,
            } => {
                self.launch(
                    kernel.as_deref(),
                    initrd.as_deref(),
                    command_line.as_deref(),
                    *raw_command_line,
                    args,
                )
                .await
            }
            ScenarioStep::WaitForPattern { pattern } => {
                let pattern = self.expand_pattern(pattern)?;
                self.console("wait for a console pattern")?
                    .wait_for_pattern(&pattern)
                    .await
                    .map(log_match)
            }
            ScenarioStep::ExecAndWait { command, pattern } => {
                let pattern = self.expand_pattern(pattern)?;
                let terminator = self.ctx.line_terminator.clone();
                let console = self.console("run a console command")?;
                CommandRunner::new(console, terminator)
                    .exec_and_wait(command, &pattern)
                    .await
                    .map(log_match)
            }
            ScenarioStep::ShutdownAndWait {
                command,
                pattern,
                timeout,
            } => self.shutdown(command, pattern.as_ref(), *timeout).await,
        }
    }

    async fn launch(
        &mut self,
        kernel: Option<&str>,
        initrd: Option<&str>,
        command_line: Option<&str>,
        raw: bool,
        args: &[String],
    ) -> Result<()> {
        if self.vm.is_some() {
            return Err(Error::invalid_state("launch a VM", "a VM is already running"));
        }

        let kernel = kernel.map(|name| self.binding(name)).transpose()?;
        let initrd = initrd.map(|name| self.binding(name)).transpose()?;
        let command_line = command_line.map(|cl| {
            if raw {
                cl.to_string()
            } else {
                format!("{}{}", self.ctx.common_command_line, cl)
            }
        });
        let args = args
            .iter()
            .map(|arg| self.expand(arg))
            .collect::<Result<Vec<_>>>()?;

        let request = LaunchRequest {
            kernel,
            initrd,
            command_line: command_line.clone(),
            args,
        };
        let mut vm = self.ctx.controller.launch(&request).await?;
        let transport = match vm.take_console() {
            Some(transport) => transport,
            None => {
                let _ = vm.terminate().await;
                return Err(Error::ProcessLaunch("VM handle has no console".to_string()));
            }
        };

        let mut options = self.ctx.session.clone();
        if let Some(dir) = &self.ctx.console_log_dir {
            options.log_file = Some(dir.join(format!("{}.console.log", file_safe(self.name))));
        }
        // Own the VM before anything else can fail so teardown reaches it
        self.vm = Some(vm);
        self.console = Some(ConsoleSession::open(transport, &options).await?);
        self.command_line = command_line;
        Ok(())
    }

    async fn shutdown(
        &mut self,
        command: &str,
        pattern: Option<&Pattern>,
        timeout: Duration,
    ) -> Result<()> {
        let pattern = pattern.map(|p| self.expand_pattern(p)).transpose()?;
        let terminator = self.ctx.line_terminator.clone();
        let console = self.console("shut down the VM")?;
        let mut runner = CommandRunner::new(console, terminator);
        match &pattern {
            Some(pattern) => {
                runner.exec_and_wait(command, pattern).await?;
            }
            None => {
                runner.exec(command).await?;
            }
        }

        let vm = self
            .vm
            .as_mut()
            .ok_or_else(|| Error::invalid_state("shut down the VM", "no VM is running"))?;
        let exit = match tokio::time::timeout(timeout, vm.wait()).await {
            Ok(exit) => exit?,
            Err(_) => return Err(Error::ShutdownTimeout(timeout)),
        };
        self.exit = Some(exit);
        tracing::info!(%exit, "VM shut down");

        if !exit.success() {
            return Err(Error::UnexpectedProcessExit {
                code: exit.code,
                tail: self.tail(),
            });
        }
        Ok(())
    }

    fn console(&mut self, action: &str) -> Result<&mut ConsoleSession> {
        self.console
            .as_mut()
            .ok_or_else(|| Error::invalid_state(action, "no VM is running"))
    }

    fn tail(&self) -> String {
        self.console
            .as_ref()
            .map(ConsoleSession::tail)
            .unwrap_or_default()
    }

    fn binding(&self, name: &str) -> Result<PathBuf> {
        self.bindings
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownBinding(name.to_string()))
    }

    fn scratch_dir(&mut self) -> Result<&Path> {
        if self.scratch.is_none() {
            let dir = tempfile::Builder::new().prefix("functest-").tempdir()?;
            tracing::debug!(path = %dir.path().display(), "Created scratch directory");
            self.scratch = Some(dir);
        }
        match &self.scratch {
            Some(dir) => Ok(dir.path()),
            None => Err(Error::Internal("scratch directory missing".to_string())),
        }
    }

    fn expand_pattern(&mut self, pattern: &Pattern) -> Result<Pattern> {
        Ok(Pattern {
            text: self.expand(&pattern.text)?,
            ..pattern.clone()
        })
    }

    /// Replace `{name}` placeholders; braces around non-identifiers stay as-is
    ///
    /// `{{` and `}}` produce literal braces, so `{{HOME}}` matches `{HOME}`.
    fn expand(&mut self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(at) = rest.find(|c| c == '{' || c == '}') {
            out.push_str(&rest[..at]);
            let tail = &rest[at..];
            if tail.starts_with("{{") || tail.starts_with("}}") {
                out.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }
            let after = &tail[1..];
            match after.find('}') {
                Some(close) if tail.starts_with('{') && is_identifier(&after[..close]) => {
                    let value = self.placeholder(&after[..close])?;
                    out.push_str(&value);
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push_str(&tail[..1]);
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    fn placeholder(&mut self, name: &str) -> Result<String> {
        match name {
            "scratch" => Ok(self.scratch_dir()?.display().to_string()),
            "command_line" => self
                .command_line
                .clone()
                .ok_or_else(|| Error::UnknownBinding(name.to_string())),
            _ => Ok(self.binding(name)?.display().to_string()),
        }
    }

    /// Turn console failures caused by a dead VM into process failures
    async fn diagnose(&mut self, error: Error) -> Error {
        let console_failure = matches!(
            error,
            Error::ConsoleTimeout { .. } | Error::ConsoleClosed { .. } | Error::Io(_)
        );
        if !console_failure {
            return error;
        }
        let Some(vm) = self.vm.as_mut() else {
            return error;
        };

        let exit = match vm.try_wait() {
            Ok(Some(exit)) => Some(exit),
            // EOF on the console usually means the process is on its way out
            _ if matches!(error, Error::ConsoleClosed { .. }) => {
                tokio::time::timeout(EXIT_GRACE, vm.wait())
                    .await
                    .ok()
                    .and_then(|r| r.ok())
            }
            _ => None,
        };

        match exit {
            Some(exit) => {
                self.exit = Some(exit);
                Error::UnexpectedProcessExit {
                    code: exit.code,
                    tail: error
                        .console_tail()
                        .map(str::to_string)
                        .unwrap_or_else(|| self.tail()),
                }
            }
            None => error,
        }
    }

    /// Release the console, the VM and the scratch directory
    async fn teardown(&mut self) {
        if let Some(mut console) = self.console.take() {
            console.close().await;
        }
        if let Some(mut vm) = self.vm.take() {
            match vm.terminate().await {
                Ok(exit) => {
                    tracing::debug!(%exit, "VM released");
                    self.exit.get_or_insert(exit);
                }
                Err(e) => tracing::warn!(error = %e, "Failed to terminate VM"),
            }
        }
        if let Some(dir) = self.scratch.take() {
            if let Err(e) = dir.close() {
                tracing::warn!(error = %e, "Failed to remove scratch directory");
            }
        }
    }
}

fn log_match(m: Match) {
    tracing::debug!(line = %m.text, "Matched");
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
