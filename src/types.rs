use std::fmt;

/// Image/build name supplied by the caller. Never empty.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BuildRef(String);

impl BuildRef {
    /// Returns `None` for empty or whitespace-only names.
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pod identity (use UID to avoid confusing replaced pods).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum StepRole {
    Init,
    Main,
}

/// One declared container of the build pod.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ContainerSpec {
    pub name: String,
    pub role: StepRole,
    /// Declared position across init containers then main containers.
    pub ordinal: usize,
}

/// The located build pod. The container list does not change for the life of a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PodDescriptor {
    pub key: PodKey,
    pub resource_version: Option<String>,
    pub containers: Vec<ContainerSpec>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum StepState {
    #[default]
    Waiting,
    Streaming,
    Completed,
    Failed,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Unknown is never terminal; it only means the watch is disconnected.
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// What the cluster reports about one container at a point in time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ContainerObservation {
    Waiting,
    Running,
    Terminated {
        exit_code: i32,
        reason: Option<String>,
    },
}

/// Point-in-time status of the build pod.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PodSnapshot {
    pub resource_version: Option<String>,
    pub phase: PodPhase,
    /// Pod-level failure message, if any (eviction, deadline exceeded).
    pub message: Option<String>,
    /// Observations keyed by container name; containers without status are absent.
    pub containers: Vec<(String, ContainerObservation)>,
}

impl PodSnapshot {
    pub fn observation(&self, container: &str) -> Option<&ContainerObservation> {
        self.containers
            .iter()
            .find(|(name, _)| name == container)
            .map(|(_, obs)| obs)
    }
}

/// Items delivered by a pod status subscription.
#[derive(Clone, Debug)]
pub enum PodUpdate {
    Snapshot(PodSnapshot),
    /// Progress marker carrying only a resume position.
    Bookmark { resource_version: String },
    Deleted,
}

/// Why a build (or one of its steps) failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailureReason {
    pub step: Option<String>,
    pub exit_code: Option<i32>,
    pub message: String,
}

impl FailureReason {
    pub fn step(name: &str, exit_code: i32, reason: Option<&str>) -> Self {
        let message = match reason {
            Some(r) => format!("step {name} exited with code {exit_code} ({r})"),
            None => format!("step {name} exited with code {exit_code}"),
        };
        Self {
            step: Some(name.to_string()),
            exit_code: Some(exit_code),
            message,
        }
    }

    pub fn pod(message: impl Into<String>) -> Self {
        Self {
            step: None,
            exit_code: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Step-level events produced by the phase watcher and consumed by the multiplexer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StepEvent {
    StepStarted(ContainerSpec),
    StepSucceeded(ContainerSpec),
    StepFailed(ContainerSpec, FailureReason),
    PodTerminal(PodPhase, Option<FailureReason>),
}

/// Final outcome of a log session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TerminalResult {
    Succeeded,
    Failed(FailureReason),
    Cancelled,
}

impl TerminalResult {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            TerminalResult::Succeeded => 0,
            TerminalResult::Failed(_) => 1,
            TerminalResult::Cancelled => 130,
        }
    }
}
