use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;

use crate::types::{ContainerSpec, FailureReason, PodDescriptor, PodPhase, StepEvent, StepState};

/// Terminal pod phase as reported by the phase watcher.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PodTerminal {
    pub phase: PodPhase,
    pub reason: Option<FailureReason>,
}

/// Step states as recorded from delivered events.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    pub steps: Vec<StepState>,
    pub failures: Vec<Option<FailureReason>>,
    pub terminal: Option<PodTerminal>,
    /// The event channel closed; no further updates will arrive.
    pub closed: bool,
}

impl Progress {
    /// True once nothing more can happen to step `idx`.
    pub fn step_settled(&self, idx: usize) -> bool {
        self.steps[idx].is_terminal() || self.terminal.is_some() || self.closed
    }

    /// True once step `idx` has started or nothing more can happen to it.
    pub fn step_ready(&self, idx: usize) -> bool {
        self.steps[idx] != StepState::Waiting || self.terminal.is_some() || self.closed
    }
}

/// State of one log session.
///
/// Each cell has exactly one writer: `phase` belongs to the phase watcher,
/// `progress` to the multiplexer's event pump and `cursor` to its copy loop.
pub struct SessionState {
    pub pod: PodDescriptor,
    pub steps: Vec<ContainerSpec>,
    phase: watch::Sender<PodPhase>,
    progress: watch::Sender<Progress>,
    cursor: AtomicUsize,
}

impl SessionState {
    pub fn new(pod: PodDescriptor, steps: Vec<ContainerSpec>) -> Self {
        let progress = Progress {
            steps: vec![StepState::Waiting; steps.len()],
            failures: vec![None; steps.len()],
            terminal: None,
            closed: false,
        };

        Self {
            pod,
            steps,
            phase: watch::channel(PodPhase::Pending).0,
            progress: watch::channel(progress).0,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn phase(&self) -> PodPhase {
        *self.phase.borrow()
    }

    pub fn set_phase(&self, phase: PodPhase) {
        self.phase.send_if_modified(|p| {
            let changed = *p != phase;
            *p = phase;
            changed
        });
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn progress_now(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn set_cursor(&self, idx: usize) {
        self.cursor.store(idx, Ordering::Release);
    }

    fn index_of(&self, spec: &ContainerSpec) -> Option<usize> {
        self.steps.iter().position(|s| s.name == spec.name)
    }

    /// Records a delivered event.
    pub fn record(&self, event: StepEvent) {
        self.progress.send_modify(|p| match event {
            StepEvent::StepStarted(spec) => {
                if let Some(i) = self.index_of(&spec) {
                    p.steps[i] = StepState::Streaming;
                }
            }
            StepEvent::StepSucceeded(spec) => {
                if let Some(i) = self.index_of(&spec) {
                    p.steps[i] = StepState::Completed;
                }
            }
            StepEvent::StepFailed(spec, reason) => {
                if let Some(i) = self.index_of(&spec) {
                    p.steps[i] = StepState::Failed;
                    p.failures[i] = Some(reason);
                }
            }
            StepEvent::PodTerminal(phase, reason) => {
                p.terminal = Some(PodTerminal { phase, reason });
            }
        });
    }

    pub fn close_progress(&self) {
        self.progress.send_modify(|p| p.closed = true);
    }
}
