use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::{sleep_or_cancel, Backoff};
use crate::cluster::Cluster;
use crate::errors::{AppError, AppResult};
use crate::state::SessionState;
use crate::types::{
    ContainerObservation, ContainerSpec, FailureReason, PodPhase, PodSnapshot, PodUpdate,
    StepEvent, StepState,
};

#[derive(Clone, Copy, Debug)]
pub struct WatchOptions {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed reconnects before giving up. `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Turns raw pod snapshots into ordered, deduplicated step events.
///
/// Steps are walked in sequence order and a step is only looked at once its
/// predecessor is Completed, so step k's end is always emitted before step
/// k+1's start. Transitions already emitted are never emitted again, which
/// makes repeated baselines after a reconnect harmless.
#[derive(Debug)]
pub struct StepTracker {
    steps: Vec<ContainerSpec>,
    delivered: Vec<StepState>,
    terminal: bool,
}

impl StepTracker {
    pub fn new(steps: Vec<ContainerSpec>) -> Self {
        let delivered = vec![StepState::Waiting; steps.len()];
        Self {
            steps,
            delivered,
            terminal: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn observe(&mut self, snap: &PodSnapshot) -> Vec<StepEvent> {
        let mut events = Vec::new();
        if self.terminal {
            return events;
        }

        for i in 0..self.steps.len() {
            match snap.observation(&self.steps[i].name) {
                Some(ContainerObservation::Running) => self.start(i, &mut events),
                Some(ContainerObservation::Terminated { exit_code, reason }) => {
                    self.start(i, &mut events);
                    if self.delivered[i] == StepState::Streaming {
                        if *exit_code == 0 {
                            self.succeed(i, &mut events);
                        } else {
                            let spec = self.steps[i].clone();
                            let reason = FailureReason::step(&spec.name, *exit_code, reason.as_deref());
                            self.delivered[i] = StepState::Failed;
                            events.push(StepEvent::StepFailed(spec, reason.clone()));
                            // A failed step halts the build; later steps never run.
                            events.push(StepEvent::PodTerminal(PodPhase::Failed, Some(reason)));
                            self.terminal = true;
                            return events;
                        }
                    }
                }
                Some(ContainerObservation::Waiting) | None => {}
            }

            if self.delivered[i] != StepState::Completed {
                break;
            }
        }

        match snap.phase {
            PodPhase::Succeeded => {
                // Every container of a succeeded pod exited 0, reported or not.
                for i in 0..self.steps.len() {
                    self.start(i, &mut events);
                    if self.delivered[i] == StepState::Streaming {
                        self.succeed(i, &mut events);
                    }
                }
                events.push(StepEvent::PodTerminal(PodPhase::Succeeded, None));
                self.terminal = true;
            }
            PodPhase::Failed => {
                let message = snap
                    .message
                    .clone()
                    .unwrap_or_else(|| "build pod failed".to_string());
                events.push(StepEvent::PodTerminal(
                    PodPhase::Failed,
                    Some(FailureReason::pod(message)),
                ));
                self.terminal = true;
            }
            _ => {}
        }

        events
    }

    pub fn deleted(&mut self) -> Vec<StepEvent> {
        if self.terminal {
            return Vec::new();
        }
        self.terminal = true;
        vec![StepEvent::PodTerminal(
            PodPhase::Failed,
            Some(FailureReason::pod("build pod deleted")),
        )]
    }

    fn start(&mut self, i: usize, events: &mut Vec<StepEvent>) {
        if self.delivered[i] == StepState::Waiting {
            self.delivered[i] = StepState::Streaming;
            events.push(StepEvent::StepStarted(self.steps[i].clone()));
        }
    }

    fn succeed(&mut self, i: usize, events: &mut Vec<StepEvent>) {
        self.delivered[i] = StepState::Completed;
        events.push(StepEvent::StepSucceeded(self.steps[i].clone()));
    }
}

/// Watches the build pod and feeds step events to `tx` until the pod is
/// terminal, the receiver goes away or `cancel` fires.
///
/// Lost connections put the session phase into Unknown and are retried with
/// capped exponential backoff, resuming after the last seen resource version.
/// A watch the server simply times out is reopened at once.
pub fn spawn_phase_watcher(
    cluster: Arc<dyn Cluster>,
    state: Arc<SessionState>,
    tx: mpsc::Sender<StepEvent>,
    opts: WatchOptions,
    cancel: CancellationToken,
) -> JoinHandle<AppResult<()>> {
    tokio::spawn(async move {
        let pod = state.pod.key.clone();
        let mut tracker = StepTracker::new(state.steps.clone());
        let mut backoff = Backoff::new(opts.min_backoff, opts.max_backoff);
        let mut resume: Option<String> = None;
        let mut last_known = state.phase();
        let mut failures: u32 = 0;

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = cluster.watch_pod(&pod, resume.clone()) => r,
            };

            let lost = match subscribed {
                Ok(mut updates) => {
                    let opened = Instant::now();
                    if state.phase() == PodPhase::Unknown {
                        state.set_phase(last_known);
                    }

                    loop {
                        let item = tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            item = updates.next() => item,
                        };

                        let update = match item {
                            Some(Ok(update)) => update,
                            Some(Err(e)) => break Some(e),
                            // Server-side watch timeout.
                            None if opened.elapsed() >= opts.min_backoff => break None,
                            None => {
                                break Some(AppError::WatchConnection(
                                    "watch closed right after opening".to_string(),
                                ))
                            }
                        };

                        backoff.reset();
                        failures = 0;

                        let events = match update {
                            PodUpdate::Snapshot(snap) => {
                                if let Some(version) = snap.resource_version.clone() {
                                    resume = Some(version);
                                }
                                last_known = snap.phase;
                                state.set_phase(snap.phase);
                                tracker.observe(&snap)
                            }
                            PodUpdate::Bookmark { resource_version } => {
                                resume = Some(resource_version);
                                Vec::new()
                            }
                            PodUpdate::Deleted => tracker.deleted(),
                        };

                        for event in events {
                            tracing::debug!(event = ?event, "step event");
                            let sent = tokio::select! {
                                _ = cancel.cancelled() => return Ok(()),
                                r = tx.send(event) => r,
                            };
                            if sent.is_err() {
                                // Multiplexer is gone.
                                return Ok(());
                            }
                        }

                        if tracker.is_terminal() {
                            return Ok(());
                        }
                    }
                }
                Err(e) => Some(e),
            };

            let Some(lost) = lost else {
                tracing::debug!(
                    namespace = %pod.namespace,
                    pod = %pod.name,
                    "pod watch closed by server; resubscribing"
                );
                continue;
            };

            if matches!(lost, AppError::WatchExpired) {
                resume = None;
            }

            failures += 1;
            if opts.max_attempts.is_some_and(|max| failures > max) {
                return Err(lost);
            }

            if state.phase() != PodPhase::Unknown {
                last_known = state.phase();
                state.set_phase(PodPhase::Unknown);
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                namespace = %pod.namespace,
                pod = %pod.name,
                error = %lost,
                delay_ms = delay.as_millis() as u64,
                "pod watch lost; reconnecting"
            );
            if !sleep_or_cancel(delay, &cancel).await {
                return Ok(());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::scripted::{BuildScript, ScriptStep, ScriptedCluster};
    use crate::types::StepRole;

    fn specs(names: &[&str]) -> Vec<ContainerSpec> {
        names
            .iter()
            .enumerate()
            .map(|(ordinal, name)| ContainerSpec {
                name: name.to_string(),
                role: StepRole::Init,
                ordinal,
            })
            .collect()
    }

    fn snap(phase: PodPhase, containers: &[(&str, ContainerObservation)]) -> PodSnapshot {
        PodSnapshot {
            resource_version: None,
            phase,
            message: None,
            containers: containers
                .iter()
                .map(|(n, o)| (n.to_string(), o.clone()))
                .collect(),
        }
    }

    fn exited(code: i32) -> ContainerObservation {
        ContainerObservation::Terminated {
            exit_code: code,
            reason: None,
        }
    }

    fn names(events: &[StepEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                StepEvent::StepStarted(s) => format!("start:{}", s.name),
                StepEvent::StepSucceeded(s) => format!("ok:{}", s.name),
                StepEvent::StepFailed(s, _) => format!("fail:{}", s.name),
                StepEvent::PodTerminal(p, _) => format!("terminal:{p:?}"),
            })
            .collect()
    }

    #[test]
    fn running_then_exit_zero_emits_start_and_success_once() {
        let mut t = StepTracker::new(specs(&["prepare", "build"]));

        let running = snap(PodPhase::Running, &[("prepare", ContainerObservation::Running)]);
        assert_eq!(names(&t.observe(&running)), ["start:prepare"]);
        assert!(t.observe(&running).is_empty());

        let done = snap(
            PodPhase::Running,
            &[("prepare", exited(0)), ("build", ContainerObservation::Running)],
        );
        assert_eq!(names(&t.observe(&done)), ["ok:prepare", "start:build"]);
        assert!(t.observe(&done).is_empty());
    }

    #[test]
    fn fast_failing_step_is_started_then_failed_and_terminal() {
        let mut t = StepTracker::new(specs(&["prepare", "build", "export"]));

        let failed = snap(PodPhase::Running, &[("prepare", exited(0)), ("build", exited(1))]);
        let events = t.observe(&failed);
        assert_eq!(
            names(&events),
            ["start:prepare", "ok:prepare", "start:build", "fail:build", "terminal:Failed"]
        );
        match &events[3] {
            StepEvent::StepFailed(_, reason) => {
                assert_eq!(reason.step.as_deref(), Some("build"));
                assert_eq!(reason.exit_code, Some(1));
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(t.is_terminal());
        assert!(t.observe(&failed).is_empty());
    }

    #[test]
    fn later_step_is_not_started_before_earlier_one_completes() {
        let mut t = StepTracker::new(specs(&["a", "b"]));
        let odd = snap(
            PodPhase::Running,
            &[("a", ContainerObservation::Running), ("b", ContainerObservation::Running)],
        );
        assert_eq!(names(&t.observe(&odd)), ["start:a"]);
    }

    #[test]
    fn succeeded_pod_completes_unreported_steps() {
        let mut t = StepTracker::new(specs(&["a", "b"]));
        let events = t.observe(&snap(PodPhase::Succeeded, &[("a", exited(0))]));
        assert_eq!(
            names(&events),
            ["start:a", "ok:a", "start:b", "ok:b", "terminal:Succeeded"]
        );
    }

    #[test]
    fn pod_level_failure_and_deletion_are_terminal() {
        let mut t = StepTracker::new(specs(&["a"]));
        let mut failed = snap(PodPhase::Failed, &[]);
        failed.message = Some("The node was low on resource".to_string());
        let events = t.observe(&failed);
        assert_eq!(names(&events), ["terminal:Failed"]);

        let mut t = StepTracker::new(specs(&["a"]));
        assert_eq!(names(&t.deleted()), ["terminal:Failed"]);
        assert!(t.deleted().is_empty());
    }

    async fn collect(mut rx: mpsc::Receiver<StepEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.extend(names(&[ev]));
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resumes_without_duplicate_or_missing_events() {
        let mut script = BuildScript::new(
            "app",
            vec![
                ScriptStep::init("prepare", &["ok"], 0),
                ScriptStep::init("build", &["compiled"], 0),
                ScriptStep::main("completion", &[], 0),
            ],
        );
        script.watch_drops = vec![3];
        let cluster = ScriptedCluster::start(script.clone());
        let pod = script_descriptor(&cluster, "app").await;

        let steps = crate::steps::sequence(&pod);
        let state = Arc::new(SessionState::new(pod, steps));
        let (tx, rx) = mpsc::channel(4);

        let handle = spawn_phase_watcher(
            cluster.clone(),
            state.clone(),
            tx,
            WatchOptions::default(),
            CancellationToken::new(),
        );

        let events = collect(rx).await;
        handle.await.unwrap().unwrap();

        assert_eq!(
            events,
            [
                "start:prepare",
                "ok:prepare",
                "start:build",
                "ok:build",
                "start:completion",
                "ok:completion",
                "terminal:Succeeded"
            ]
        );

        let subs = cluster.subscriptions();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0], None);
        assert!(subs[1].is_some(), "reconnect should resume from a version");
        assert_eq!(state.phase(), PodPhase::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_watcher_stops_quietly() {
        let cluster = ScriptedCluster::start(BuildScript::demo("app", 50, None));
        let pod = script_descriptor(&cluster, "app").await;
        let steps = crate::steps::sequence(&pod);
        let state = Arc::new(SessionState::new(pod, steps));
        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let handle = spawn_phase_watcher(cluster, state, tx, WatchOptions::default(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert!(handle.await.unwrap().is_ok());
    }

    fn start_watcher(
        cluster: &Arc<ScriptedCluster>,
        pod: crate::types::PodDescriptor,
        opts: WatchOptions,
    ) -> (
        Arc<SessionState>,
        mpsc::Receiver<StepEvent>,
        JoinHandle<AppResult<()>>,
    ) {
        let steps = crate::steps::sequence(&pod);
        let state = Arc::new(SessionState::new(pod, steps));
        let (tx, rx) = mpsc::channel(16);
        let handle = spawn_phase_watcher(
            cluster.clone(),
            state.clone(),
            tx,
            opts,
            CancellationToken::new(),
        );
        (state, rx, handle)
    }

    fn three_steps() -> BuildScript {
        BuildScript::new(
            "app",
            vec![
                ScriptStep::init("prepare", &["ok"], 0),
                ScriptStep::init("build", &["compiled"], 0),
                ScriptStep::main("completion", &[], 0),
            ],
        )
    }

    const THREE_STEP_EVENTS: [&str; 7] = [
        "start:prepare",
        "ok:prepare",
        "start:build",
        "ok:build",
        "start:completion",
        "ok:completion",
        "terminal:Succeeded",
    ];

    #[tokio::test(start_paused = true)]
    async fn idle_reconnect_leaves_unknown_right_away() {
        let mut script = BuildScript::new("app", vec![ScriptStep::init("prepare", &["ok"], 0)]);
        script.line_delay = Duration::from_secs(20);
        script.watch_drops = vec![1];
        let cluster = ScriptedCluster::start(script);
        let pod = script_descriptor(&cluster, "app").await;

        let (state, _rx, handle) = start_watcher(&cluster, pod, WatchOptions::default());
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(cluster.subscriptions(), [None, Some("1".to_string())]);
        assert_eq!(state.phase(), PodPhase::Pending);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_resume_relists_without_duplicate_events() {
        let mut script = three_steps();
        script.watch_drops = vec![2];
        script.expire_resume = 1;
        let cluster = ScriptedCluster::start(script);
        let pod = script_descriptor(&cluster, "app").await;

        let (state, rx, handle) = start_watcher(&cluster, pod, WatchOptions::default());
        let events = collect(rx).await;
        handle.await.unwrap().unwrap();

        assert_eq!(events, THREE_STEP_EVENTS);
        let subs = cluster.subscriptions();
        assert_eq!(subs.len(), 3, "got {subs:?}");
        assert_eq!(subs[0], None);
        assert!(subs[1].is_some());
        assert_eq!(subs[2], None, "expired resume should fall back to a fresh list");
        assert_eq!(state.phase(), PodPhase::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_gives_up_after_max_attempts() {
        let mut script = three_steps();
        script.watch_drops = vec![0, 0];
        let cluster = ScriptedCluster::start(script);
        let pod = script_descriptor(&cluster, "app").await;

        let opts = WatchOptions {
            max_attempts: Some(1),
            ..WatchOptions::default()
        };
        let (_state, _rx, handle) = start_watcher(&cluster, pod, opts);
        let err = handle.await.unwrap().unwrap_err();

        assert!(matches!(err, AppError::WatchConnection(_)), "got {err:?}");
        assert_eq!(cluster.subscriptions(), [None, None]);
    }

    #[tokio::test(start_paused = true)]
    async fn server_closed_watch_resubscribes_without_going_unknown() {
        let mut script = three_steps();
        script.line_delay = Duration::from_secs(1);
        script.watch_timeout = Some(Duration::from_millis(2500));
        let cluster = ScriptedCluster::start(script);
        let pod = script_descriptor(&cluster, "app").await;

        let (state, rx, handle) = start_watcher(&cluster, pod, WatchOptions::default());
        let events = tokio::spawn(collect(rx));

        let mut seen_unknown = false;
        while !handle.is_finished() {
            seen_unknown |= state.phase() == PodPhase::Unknown;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        handle.await.unwrap().unwrap();

        assert!(!seen_unknown);
        assert_eq!(events.await.unwrap(), THREE_STEP_EVENTS);
        let subs = cluster.subscriptions();
        assert!(subs.len() >= 3, "got {subs:?}");
        assert!(subs[1..].iter().all(Option::is_some));
    }

    async fn script_descriptor(
        cluster: &Arc<ScriptedCluster>,
        image: &str,
    ) -> crate::types::PodDescriptor {
        let build = crate::types::BuildRef::new(image).unwrap();
        cluster.find_pods(&build).await.unwrap().remove(0)
    }
}
