//! In-process simulation of a kpack build pod.
//!
//! A driver task plays a [`BuildScript`] forward in (tokio) time: the pod
//! appears, each step runs, emits its lines and exits with its scripted code.
//! Faults such as dropped watches or failing log opens can be injected so the
//! session logic can be exercised without a cluster.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{sleep, sleep_until, Instant};

use crate::cluster::{Cluster, LogStream, PodWatch};
use crate::errors::{AppError, AppResult};
use crate::types::{
    BuildRef, ContainerObservation, ContainerSpec, PodDescriptor, PodKey, PodPhase, PodSnapshot,
    PodUpdate, StepRole,
};

#[derive(Clone, Debug)]
pub struct ScriptStep {
    pub name: String,
    pub role: StepRole,
    /// Lines written by the step; each gets a trailing newline.
    pub lines: Vec<String>,
    pub exit_code: i32,
}

impl ScriptStep {
    pub fn init(name: &str, lines: &[&str], exit_code: i32) -> Self {
        Self {
            name: name.to_string(),
            role: StepRole::Init,
            lines: lines.iter().map(|l| l.to_string()).collect(),
            exit_code,
        }
    }

    pub fn main(name: &str, lines: &[&str], exit_code: i32) -> Self {
        Self {
            role: StepRole::Main,
            ..Self::init(name, lines, exit_code)
        }
    }
}

#[derive(Clone, Debug)]
pub struct BuildScript {
    pub namespace: String,
    pub image: String,
    pub pod_name: String,
    pub steps: Vec<ScriptStep>,
    /// Pause between consecutive lines and around step transitions.
    pub line_delay: Duration,
    /// How long the pod stays invisible to listing.
    pub appear_after: Duration,
    /// Number of pods that will match the image (0 never appears, >1 is ambiguous).
    pub pod_count: usize,
    /// Per subscription: number of updates delivered before the watch drops.
    pub watch_drops: Vec<usize>,
    /// Number of resumed subscriptions rejected as expired before one is accepted.
    pub expire_resume: usize,
    /// Every subscription ends cleanly once it has been open this long.
    pub watch_timeout: Option<Duration>,
    /// Container name -> number of log opens that fail before one succeeds.
    pub log_open_failures: HashMap<String, usize>,
    /// Container name -> number of opened streams that break after their first chunk.
    pub log_read_failures: HashMap<String, usize>,
}

impl BuildScript {
    pub fn new(image: &str, steps: Vec<ScriptStep>) -> Self {
        Self {
            namespace: "default".to_string(),
            image: image.to_string(),
            pod_name: format!("{image}-build-1-build-pod"),
            steps,
            line_delay: Duration::from_millis(10),
            appear_after: Duration::ZERO,
            pod_count: 1,
            watch_drops: Vec::new(),
            expire_resume: 0,
            watch_timeout: None,
            log_open_failures: HashMap::new(),
            log_read_failures: HashMap::new(),
        }
    }

    /// A kpack-looking build: the lifecycle phases as init containers and a
    /// `completion` main container. `fail_step` exits 1 instead of 0.
    pub fn demo(image: &str, lines_per_step: u64, fail_step: Option<&str>) -> Self {
        let phases = ["prepare", "analyze", "detect", "restore", "build", "export"];

        let mut steps: Vec<ScriptStep> = phases
            .iter()
            .map(|phase| {
                let mut lines = vec![format!("===> {}", phase.to_uppercase())];
                lines.extend((1..=lines_per_step).map(|n| format!("{phase}: line {n}")));
                ScriptStep {
                    name: phase.to_string(),
                    role: StepRole::Init,
                    lines,
                    exit_code: 0,
                }
            })
            .collect();
        steps.push(ScriptStep::main("completion", &["Build successful"], 0));

        if let Some(fail) = fail_step {
            for step in steps.iter_mut().filter(|s| s.name == fail) {
                step.lines.push(format!("ERROR: {fail} failed"));
                step.exit_code = 1;
            }
        }

        Self::new(image, steps)
    }

    fn descriptor(&self, idx: usize) -> PodDescriptor {
        let name = if self.pod_count > 1 {
            format!("{}-{idx}", self.pod_name)
        } else {
            self.pod_name.clone()
        };

        PodDescriptor {
            key: PodKey {
                namespace: self.namespace.clone(),
                uid: format!("uid-{name}"),
                name,
            },
            resource_version: Some("1".to_string()),
            containers: self
                .steps
                .iter()
                .enumerate()
                .map(|(ordinal, s)| ContainerSpec {
                    name: s.name.clone(),
                    role: s.role,
                    ordinal,
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug)]
struct SimState {
    version: u64,
    phase: PodPhase,
    containers: Vec<ContainerObservation>,
    logs: Vec<Vec<u8>>,
}

impl SimState {
    fn snapshot(&self, script: &BuildScript) -> PodSnapshot {
        PodSnapshot {
            resource_version: Some(self.version.to_string()),
            phase: self.phase,
            message: None,
            containers: script
                .steps
                .iter()
                .zip(&self.containers)
                .map(|(s, obs)| (s.name.clone(), obs.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    watch_drops: VecDeque<usize>,
    expire_resume: usize,
    log_open_failures: HashMap<String, usize>,
    log_read_failures: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct Recorded {
    subscriptions: Vec<Option<String>>,
    log_opens: Vec<String>,
}

/// [`Cluster`] serving one simulated build pod.
pub struct ScriptedCluster {
    script: Arc<BuildScript>,
    state: watch::Receiver<SimState>,
    visible_at: Instant,
    faults: Mutex<Faults>,
    recorded: Mutex<Recorded>,
    driver: AbortHandle,
}

impl ScriptedCluster {
    /// Starts the simulation. Must be called from within a tokio runtime.
    pub fn start(script: BuildScript) -> Arc<Self> {
        let initial = SimState {
            version: 1,
            phase: PodPhase::Pending,
            containers: vec![ContainerObservation::Waiting; script.steps.len()],
            logs: vec![Vec::new(); script.steps.len()],
        };
        let (tx, rx) = watch::channel(initial);

        let faults = Faults {
            watch_drops: script.watch_drops.iter().copied().collect(),
            expire_resume: script.expire_resume,
            log_open_failures: script.log_open_failures.clone(),
            log_read_failures: script.log_read_failures.clone(),
        };

        let script = Arc::new(script);
        let driver = tokio::spawn(drive(script.clone(), tx)).abort_handle();

        Arc::new(Self {
            visible_at: Instant::now() + script.appear_after,
            script,
            state: rx,
            faults: Mutex::new(faults),
            recorded: Mutex::new(Recorded::default()),
            driver,
        })
    }

    /// Resume positions passed to each `watch_pod` call, in call order.
    pub fn subscriptions(&self) -> Vec<Option<String>> {
        lock(&self.recorded).subscriptions.clone()
    }

    /// Containers whose logs were opened, in call order (failed opens included).
    pub fn log_opens(&self) -> Vec<String> {
        lock(&self.recorded).log_opens.clone()
    }

    fn step_index(&self, pod: &PodKey, container: &str) -> AppResult<usize> {
        if !pod.name.starts_with(&self.script.pod_name) {
            return Err(AppError::Other(format!("pod {pod} not found")));
        }
        self.script
            .steps
            .iter()
            .position(|s| s.name == container)
            .ok_or_else(|| AppError::Other(format!("container {container} not found in {pod}")))
    }
}

impl Drop for ScriptedCluster {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn take_one(counts: &mut HashMap<String, usize>, key: &str) -> bool {
    match counts.get_mut(key) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

async fn drive(script: Arc<BuildScript>, tx: watch::Sender<SimState>) {
    sleep(script.appear_after).await;
    let last = script.steps.len().saturating_sub(1);

    for (i, step) in script.steps.iter().enumerate() {
        sleep(script.line_delay).await;
        tx.send_modify(|s| {
            s.phase = PodPhase::Running;
            s.containers[i] = ContainerObservation::Running;
            s.version += 1;
        });

        for line in &step.lines {
            sleep(script.line_delay).await;
            tx.send_modify(|s| {
                s.logs[i].extend_from_slice(line.as_bytes());
                s.logs[i].push(b'\n');
            });
        }

        sleep(script.line_delay).await;
        let failed = step.exit_code != 0;
        tx.send_modify(|s| {
            s.containers[i] = ContainerObservation::Terminated {
                exit_code: step.exit_code,
                reason: Some(if failed { "Error" } else { "Completed" }.to_string()),
            };
            if failed {
                s.phase = PodPhase::Failed;
            } else if i == last {
                s.phase = PodPhase::Succeeded;
            }
            s.version += 1;
        });

        if failed {
            return;
        }
    }

    if script.steps.is_empty() {
        tx.send_modify(|s| {
            s.phase = PodPhase::Succeeded;
            s.version += 1;
        });
    }
}

struct WatchCursor {
    script: Arc<BuildScript>,
    rx: watch::Receiver<SimState>,
    pending: Option<PodUpdate>,
    last_version: u64,
    remaining: Option<usize>,
    closes_at: Option<Instant>,
    ended: bool,
}

impl WatchCursor {
    async fn next(mut self) -> Option<(AppResult<PodUpdate>, Self)> {
        if self.ended {
            return None;
        }

        if self.remaining == Some(0) {
            self.ended = true;
            let err = AppError::WatchConnection("simulated disconnect".to_string());
            return Some((Err(err), self));
        }

        let update = match self.pending.take() {
            Some(update) => update,
            None => loop {
                let changed = match self.closes_at {
                    Some(at) => tokio::select! {
                        r = self.rx.changed() => r,
                        _ = sleep_until(at) => return None,
                    },
                    None => self.rx.changed().await,
                };
                changed.ok()?;
                let state = self.rx.borrow_and_update();
                if state.version > self.last_version {
                    self.last_version = state.version;
                    break PodUpdate::Snapshot(state.snapshot(&self.script));
                }
            },
        };

        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        Some((Ok(update), self))
    }
}

#[async_trait]
impl Cluster for ScriptedCluster {
    async fn find_pods(&self, build: &BuildRef) -> AppResult<Vec<PodDescriptor>> {
        if build.as_str() != self.script.image || Instant::now() < self.visible_at {
            return Ok(Vec::new());
        }
        Ok((0..self.script.pod_count)
            .map(|i| self.script.descriptor(i))
            .collect())
    }

    async fn watch_pod(&self, pod: &PodKey, resume: Option<String>) -> AppResult<PodWatch> {
        lock(&self.recorded).subscriptions.push(resume.clone());
        if !pod.name.starts_with(&self.script.pod_name) {
            return Err(AppError::Other(format!("pod {pod} not found")));
        }

        if resume.is_some() {
            let mut faults = lock(&self.faults);
            if faults.expire_resume > 0 {
                faults.expire_resume -= 1;
                return Err(AppError::WatchExpired);
            }
        }

        let mut rx = self.state.clone();
        let (pending, last_version) = {
            let state = rx.borrow_and_update();
            let resume_at = match resume.as_deref().map(str::parse::<u64>) {
                None => None,
                Some(Ok(v)) => Some(v),
                Some(Err(_)) => return Err(AppError::WatchExpired),
            };
            match resume_at {
                Some(v) if v >= state.version => (None, v),
                _ => (
                    Some(PodUpdate::Snapshot(state.snapshot(&self.script))),
                    state.version,
                ),
            }
        };

        let cursor = WatchCursor {
            script: self.script.clone(),
            rx,
            pending,
            last_version,
            remaining: lock(&self.faults).watch_drops.pop_front(),
            closes_at: self.script.watch_timeout.map(|t| Instant::now() + t),
            ended: false,
        };

        Ok(futures::stream::unfold(cursor, WatchCursor::next).boxed())
    }

    async fn open_log(&self, pod: &PodKey, container: &str) -> AppResult<LogStream> {
        lock(&self.recorded).log_opens.push(container.to_string());
        let idx = self.step_index(pod, container)?;

        let (open_fails, break_after_first) = {
            let mut faults = lock(&self.faults);
            let open_fails = take_one(&mut faults.log_open_failures, container);
            let break_after_first =
                !open_fails && take_one(&mut faults.log_read_failures, container);
            (open_fails, break_after_first)
        };

        if open_fails {
            return Err(AppError::StreamConnection {
                step: container.to_string(),
                reason: "simulated connection refused".to_string(),
            });
        }
        if self.state.borrow().containers[idx] == ContainerObservation::Waiting {
            return Err(AppError::StreamConnection {
                step: container.to_string(),
                reason: format!("container {container} is waiting to start"),
            });
        }

        let chunks = futures::stream::unfold(
            (self.state.clone(), 0usize, 0usize),
            move |(mut rx, offset, sent)| async move {
                if break_after_first && sent == 1 {
                    let err = io::Error::new(io::ErrorKind::ConnectionReset, "simulated reset");
                    return Some((Err(err), (rx, offset, sent + 1)));
                }
                if break_after_first && sent > 1 {
                    return None;
                }

                loop {
                    let (chunk, exited) = {
                        let state = rx.borrow_and_update();
                        let log = &state.logs[idx];
                        let exited = matches!(
                            state.containers[idx],
                            ContainerObservation::Terminated { .. }
                        );
                        (log[offset.min(log.len())..].to_vec(), exited)
                    };

                    if !chunk.is_empty() {
                        let next = offset + chunk.len();
                        return Some((Ok(chunk), (rx, next, sent + 1)));
                    }
                    if exited {
                        return None;
                    }
                    rx.changed().await.ok()?;
                }
            },
        );

        Ok(Box::pin(chunks.boxed().into_async_read()))
    }
}
