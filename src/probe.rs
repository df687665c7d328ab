use crate::config::CommandBindings;
use crate::registry::ServiceDescriptor;
use crate::sys::{self, ProcessMetadata};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const SERVICE_PLACEHOLDER: &str = "{service}";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What the OS service manager reports. `Unknown` means "no information".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Running,
    Stopped,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCommand {
    Start,
    Stop,
}

impl ServiceCommand {
    pub fn target(self) -> ObservedState {
        match self {
            ServiceCommand::Start => ObservedState::Running,
            ServiceCommand::Stop => ObservedState::Stopped,
        }
    }
}

impl std::fmt::Display for ServiceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceCommand::Start => write!(f, "start"),
            ServiceCommand::Stop => write!(f, "stop"),
        }
    }
}

/// Normalized outcome of a start/stop invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResult {
    Succeeded,
    AlreadyInDesiredState,
    Failed(String),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{0}` timed out after {1:?}")]
    TimedOut(String, Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("status query unavailable: {0}")]
    Unavailable(#[from] CommandError),
    #[error("unrecognized status output: {0}")]
    Unrecognized(String),
}

// ---------------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------------

pub fn parse_command(command: &str) -> Result<(String, Vec<String>), CommandError> {
    let words = shell_words::split(command)
        .map_err(|e| CommandError::InvalidCommand(format!("failed to parse: {e}")))?;

    if words.is_empty() {
        return Err(CommandError::InvalidCommand("command is empty".to_string()));
    }

    let program = words[0].clone();
    let args = words[1..].to_vec();
    Ok((program, args))
}

/// Split `template` and substitute the OS service name into every word.
pub fn render_command(
    template: &str,
    service_name: &str,
) -> Result<(String, Vec<String>), CommandError> {
    let (program, args) = parse_command(template)?;
    let program = program.replace(SERVICE_PLACEHOLDER, service_name);
    let args = args
        .into_iter()
        .map(|a| a.replace(SERVICE_PLACEHOLDER, service_name))
        .collect();
    Ok((program, args))
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// The supervisor's only view of the operating system.
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Read-only status query. Failures map to [`ObservedState::Unknown`].
    async fn probe(&self, service: &ServiceDescriptor) -> ObservedState;

    async fn execute(&self, service: &ServiceDescriptor, command: ServiceCommand)
    -> CommandResult;

    async fn process_metadata(&self, _service: &ServiceDescriptor) -> Option<ProcessMetadata> {
        None
    }
}

// ---------------------------------------------------------------------------
// Output normalization
// ---------------------------------------------------------------------------

/// Marker sets that turn raw service-manager output into clean results.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRules {
    pub running_markers: Vec<String>,
    pub stopped_markers: Vec<String>,
    pub already_started_markers: Vec<String>,
    pub already_stopped_markers: Vec<String>,
}

impl From<&CommandBindings> for OutputRules {
    fn from(bindings: &CommandBindings) -> Self {
        Self {
            running_markers: bindings.running_markers.clone(),
            stopped_markers: bindings.stopped_markers.clone(),
            already_started_markers: bindings.already_started_markers.clone(),
            already_stopped_markers: bindings.already_stopped_markers.clone(),
        }
    }
}

impl OutputRules {
    /// A marker matches when it equals a whitespace-separated token, so
    /// `active` does not match `inactive`.
    pub fn classify_status(&self, output: &str) -> Option<ObservedState> {
        let has = |markers: &[String]| {
            output
                .split_whitespace()
                .any(|token| markers.iter().any(|m| m == token))
        };
        if has(&self.running_markers) {
            Some(ObservedState::Running)
        } else if has(&self.stopped_markers) {
            Some(ObservedState::Stopped)
        } else {
            None
        }
    }

    pub fn classify_command(
        &self,
        command: ServiceCommand,
        success: bool,
        output: &str,
    ) -> CommandResult {
        if success {
            return CommandResult::Succeeded;
        }

        let markers = match command {
            ServiceCommand::Start => &self.already_started_markers,
            ServiceCommand::Stop => &self.already_stopped_markers,
        };
        let lowered = output.to_lowercase();
        if markers.iter().any(|m| lowered.contains(&m.to_lowercase())) {
            return CommandResult::AlreadyInDesiredState;
        }

        let trimmed = output.trim();
        if trimmed.is_empty() {
            CommandResult::Failed(format!("{command} command exited unsuccessfully"))
        } else {
            CommandResult::Failed(trimmed.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// System backend
// ---------------------------------------------------------------------------

/// Drives the OS service manager through the descriptor's command templates.
pub struct CommandBackend {
    rules: OutputRules,
    probe_timeout: Duration,
    command_timeout: Duration,
}

impl CommandBackend {
    pub fn new(rules: OutputRules, probe_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            rules,
            probe_timeout,
            command_timeout,
        }
    }

    pub async fn query(&self, service: &ServiceDescriptor) -> Result<ObservedState, ProbeError> {
        let output = run_template(
            &service.commands.status,
            &service.service_name,
            self.probe_timeout,
        )
        .await?;
        let text = combined_output(&output);
        self.rules
            .classify_status(&text)
            .ok_or_else(|| ProbeError::Unrecognized(text.trim().to_string()))
    }
}

#[async_trait]
impl ServiceBackend for CommandBackend {
    async fn probe(&self, service: &ServiceDescriptor) -> ObservedState {
        match self.query(service).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(service = %service.id, error = %e, "probe unavailable");
                ObservedState::Unknown
            }
        }
    }

    async fn execute(
        &self,
        service: &ServiceDescriptor,
        command: ServiceCommand,
    ) -> CommandResult {
        let template = match command {
            ServiceCommand::Start => &service.commands.start,
            ServiceCommand::Stop => &service.commands.stop,
        };
        match run_template(template, &service.service_name, self.command_timeout).await {
            Ok(output) => self.rules.classify_command(
                command,
                output.status.success(),
                &combined_output(&output),
            ),
            Err(e) => CommandResult::Failed(e.to_string()),
        }
    }

    async fn process_metadata(&self, service: &ServiceDescriptor) -> Option<ProcessMetadata> {
        let name = service.process_name.as_deref()?;
        sys::process_metadata(name).await
    }
}

async fn run_template(
    template: &str,
    service_name: &str,
    timeout: Duration,
) -> Result<Output, CommandError> {
    let (program, args) = render_command(template, service_name)?;

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| CommandError::SpawnFailed {
        program: program.clone(),
        source,
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| CommandError::SpawnFailed { program, source }),
        Err(_) => Err(CommandError::TimedOut(program, timeout)),
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text
}
