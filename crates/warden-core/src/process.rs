use crate::error::StartError;
use crate::prompt::PromptKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Crashed => "crashed",
        }
    }

    /// A process handle is attached in these states; a second start is refused.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }

    /// Input is accepted only while the process is up and not being stopped.
    pub fn accepts_input(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }

    pub fn can_transition_to(&self, next: ProcessState) -> bool {
        use ProcessState::*;
        match (self, next) {
            (Stopped | Crashed, Starting) => true,
            (Starting, Running) => true,
            (Starting | Running, Stopping) => true,
            (Starting | Running | Stopping, Stopped) => true,
            (Starting | Running | Stopping, Crashed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to execute for a game: resolved program path, arguments, working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    pub game_id: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub stop_command: Option<String>,
}

impl LaunchSpec {
    pub fn new(game_id: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            game_id: game_id.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            stop_command: None,
        }
    }

    pub fn validate(&self) -> Result<(), StartError> {
        if !self.program.is_file() {
            return Err(StartError::LaunchTargetMissing(self.program.clone()));
        }
        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                return Err(StartError::WorkingDirMissing(dir.clone()));
            }
        }
        Ok(())
    }

    /// `.bat`/`.cmd` scripts need the command interpreter.
    pub fn is_batch_script(&self) -> bool {
        self.program
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("bat") || ext.eq_ignore_ascii_case("cmd"))
            .unwrap_or(false)
    }
}

/// Snapshot of the single supervised server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedProcess {
    pub id: ProcessId,
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_prompt: Option<PromptKind>,
    pub launch: LaunchSpec,
}

impl ManagedProcess {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            id: ProcessId::new(),
            state: ProcessState::Stopped,
            started_at: None,
            exit_code: None,
            pid: None,
            pending_prompt: None,
            launch,
        }
    }

    pub fn game_id(&self) -> &str {
        &self.launch.game_id
    }

    /// Apply a state change and the bookkeeping tied to it. Returns the previous state.
    pub fn transition(&mut self, next: ProcessState) -> ProcessState {
        let previous = self.state;
        match next {
            ProcessState::Starting => {
                self.started_at = None;
                self.exit_code = None;
                self.pending_prompt = None;
            }
            ProcessState::Running => {
                self.started_at = Some(Utc::now());
            }
            ProcessState::Stopping => {}
            ProcessState::Stopped | ProcessState::Crashed => {
                self.started_at = None;
                self.pid = None;
                self.pending_prompt = None;
            }
        }
        self.state = next;
        previous
    }

    /// Whole seconds since the transition to `Running`.
    pub fn uptime_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        if self.state != ProcessState::Running {
            return None;
        }
        let started = self.started_at?;
        Some((now - started).num_seconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn transition_table_follows_lifecycle() {
        use ProcessState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Crashed.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Crashed));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Stopping));
    }

    #[test]
    fn live_states_block_a_second_start() {
        assert!(ProcessState::Starting.is_live());
        assert!(ProcessState::Running.is_live());
        assert!(ProcessState::Stopping.is_live());
        assert!(!ProcessState::Stopped.is_live());
        assert!(!ProcessState::Crashed.is_live());
        assert!(!ProcessState::Stopping.accepts_input());
    }

    #[test]
    fn bookkeeping_follows_transitions() {
        let mut process = ManagedProcess::new(LaunchSpec::new("survival", "/srv/start.sh"));
        process.exit_code = Some(1);
        process.transition(ProcessState::Starting);
        assert_eq!(process.exit_code, None);
        assert_eq!(process.started_at, None);

        process.transition(ProcessState::Running);
        assert!(process.started_at.is_some());
        process.pending_prompt = Some(PromptKind::AdminPassword);

        process.exit_code = Some(0);
        let previous = process.transition(ProcessState::Stopped);
        assert_eq!(previous, ProcessState::Running);
        assert_eq!(process.started_at, None);
        assert_eq!(process.pending_prompt, None);
        assert_eq!(process.exit_code, Some(0));
    }

    #[test]
    fn uptime_only_while_running() {
        let mut process = ManagedProcess::new(LaunchSpec::new("survival", "/srv/start.sh"));
        assert_eq!(process.uptime_secs(Utc::now()), None);
        process.transition(ProcessState::Starting);
        process.transition(ProcessState::Running);
        let started = process.started_at.expect("started_at");
        assert_eq!(process.uptime_secs(started + Duration::seconds(90)), Some(90));
        process.transition(ProcessState::Stopping);
        assert_eq!(process.uptime_secs(started + Duration::seconds(90)), None);
    }

    #[test]
    fn validate_reports_missing_target() {
        let spec = LaunchSpec::new("survival", "/no/such/script");
        assert_eq!(
            spec.validate(),
            Err(StartError::LaunchTargetMissing(PathBuf::from("/no/such/script")))
        );
    }

    #[test]
    fn detects_batch_scripts() {
        assert!(LaunchSpec::new("g", "C:/srv/startdedicated.BAT").is_batch_script());
        assert!(LaunchSpec::new("g", "start.cmd").is_batch_script());
        assert!(!LaunchSpec::new("g", "start.sh").is_batch_script());
        assert!(!LaunchSpec::new("g", "server").is_batch_script());
    }
}
