use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{ListParams, LogParams, WatchEvent, WatchParams};
use kube::{Api, Client, ResourceExt};

use crate::cluster::{Cluster, LogStream, PodWatch};
use crate::errors::{AppError, AppResult};
use crate::types::{
    BuildRef, ContainerObservation, ContainerSpec, PodDescriptor, PodKey, PodPhase, PodSnapshot,
    PodUpdate, StepRole,
};

/// Label kpack puts on every build pod, valued with the image name.
pub const DEFAULT_LABEL_KEY: &str = "image.kpack.io/image";

const GONE: u16 = 410;

pub async fn make_client() -> AppResult<Client> {
    let client = Client::try_default().await?;
    Ok(client)
}

/// [`Cluster`] backed by the Kubernetes API. Only reads pods and logs.
pub struct KubeCluster {
    client: Client,
    namespace: String,
    label_key: String,
    selector: Option<String>,
}

impl KubeCluster {
    pub fn new(
        client: Client,
        namespace: String,
        label_key: String,
        selector: Option<String>,
    ) -> Self {
        Self {
            client,
            namespace,
            label_key,
            selector,
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn label_selector(&self, build: &BuildRef) -> String {
        let mut selector = format!("{}={}", self.label_key, build);
        if let Some(extra) = &self.selector {
            selector.push(',');
            selector.push_str(extra);
        }
        selector
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn find_pods(&self, build: &BuildRef) -> AppResult<Vec<PodDescriptor>> {
        let lp = ListParams::default().labels(&self.label_selector(build));
        let list = self.pods(&self.namespace).list(&lp).await?;

        Ok(list.items.iter().filter_map(descriptor_of).collect())
    }

    async fn watch_pod(&self, pod: &PodKey, resume: Option<String>) -> AppResult<PodWatch> {
        let api = self.pods(&pod.namespace);
        let wp = WatchParams::default().fields(&format!("metadata.name={}", pod.name));

        let (baseline, version) = match resume {
            Some(version) => (None, version),
            None => {
                let current = api.get(&pod.name).await?;
                let version = current
                    .resource_version()
                    .unwrap_or_else(|| "0".to_string());
                (Some(PodUpdate::Snapshot(snapshot_of(&current))), version)
            }
        };

        let events = match api.watch(&wp, &version).await {
            Ok(events) => events,
            Err(kube::Error::Api(resp)) if resp.code == GONE => return Err(AppError::WatchExpired),
            Err(e) => return Err(AppError::WatchConnection(e.to_string())),
        };

        let updates = events.map(|item| match item {
            Ok(WatchEvent::Added(pod)) | Ok(WatchEvent::Modified(pod)) => {
                Ok(PodUpdate::Snapshot(snapshot_of(&pod)))
            }
            Ok(WatchEvent::Deleted(_)) => Ok(PodUpdate::Deleted),
            Ok(WatchEvent::Bookmark(bookmark)) => Ok(PodUpdate::Bookmark {
                resource_version: bookmark.metadata.resource_version,
            }),
            Ok(WatchEvent::Error(resp)) if resp.code == GONE => Err(AppError::WatchExpired),
            Ok(WatchEvent::Error(resp)) => Err(AppError::WatchConnection(resp.message)),
            Err(e) => Err(AppError::WatchConnection(e.to_string())),
        });

        Ok(futures::stream::iter(baseline.map(Ok))
            .chain(updates)
            .boxed())
    }

    async fn open_log(&self, pod: &PodKey, container: &str) -> AppResult<LogStream> {
        let lp = LogParams {
            follow: true,
            timestamps: false,
            container: Some(container.to_string()),
            ..Default::default()
        };

        let reader = self.pods(&pod.namespace).log_stream(&pod.name, &lp).await?;
        Ok(Box::pin(reader))
    }
}

/// Builds the descriptor for a pod. Pods without a uid or spec are not ready yet.
pub fn descriptor_of(pod: &Pod) -> Option<PodDescriptor> {
    let uid = pod.uid()?;
    let spec = pod.spec.as_ref()?;

    let init = spec
        .init_containers
        .iter()
        .flatten()
        .map(|c| (c.name.clone(), StepRole::Init));
    let main = spec
        .containers
        .iter()
        .map(|c| (c.name.clone(), StepRole::Main));

    let containers = init
        .chain(main)
        .enumerate()
        .map(|(ordinal, (name, role))| ContainerSpec {
            name,
            role,
            ordinal,
        })
        .collect();

    Some(PodDescriptor {
        key: PodKey {
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
            uid,
        },
        resource_version: pod.resource_version(),
        containers,
    })
}

pub fn snapshot_of(pod: &Pod) -> PodSnapshot {
    let status = pod.status.as_ref();

    let containers = status
        .into_iter()
        .flat_map(|s| {
            s.init_container_statuses
                .iter()
                .flatten()
                .chain(s.container_statuses.iter().flatten())
        })
        .map(|cs| (cs.name.clone(), observe(cs)))
        .collect();

    PodSnapshot {
        resource_version: pod.resource_version(),
        phase: PodPhase::parse(status.and_then(|s| s.phase.as_deref())),
        message: status.and_then(|s| s.message.clone()),
        containers,
    }
}

fn observe(status: &ContainerStatus) -> ContainerObservation {
    let Some(state) = status.state.as_ref() else {
        return ContainerObservation::Waiting;
    };

    if let Some(t) = state.terminated.as_ref() {
        ContainerObservation::Terminated {
            exit_code: t.exit_code,
            reason: t.reason.clone(),
        }
    } else if state.running.is_some() {
        ContainerObservation::Running
    } else {
        ContainerObservation::Waiting
    }
}
