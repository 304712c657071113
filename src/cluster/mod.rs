//! Read-only access to the cluster hosting build pods.
//!
//! Sessions receive an `Arc<dyn Cluster>` instead of reaching for a global
//! client, so the whole pipeline runs unchanged against [`scripted::ScriptedCluster`].

pub mod kube;
pub mod scripted;

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::AsyncBufRead;

use crate::errors::AppResult;
use crate::types::{BuildRef, PodDescriptor, PodKey, PodUpdate};

/// Followed output of one container. EOF once the container has exited.
pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

/// Subscription to status changes of one pod.
pub type PodWatch = BoxStream<'static, AppResult<PodUpdate>>;

#[async_trait]
pub trait Cluster: Send + Sync {
    /// All pods currently backing `build`.
    async fn find_pods(&self, build: &BuildRef) -> AppResult<Vec<PodDescriptor>>;

    /// Subscribe to status changes of `pod`.
    ///
    /// With `resume = None` the first item is a baseline snapshot of the
    /// current status. With `Some(version)` delivery continues after that
    /// resource version; [`crate::errors::AppError::WatchExpired`] means the
    /// position is gone and the caller must resubscribe without one.
    async fn watch_pod(&self, pod: &PodKey, resume: Option<String>) -> AppResult<PodWatch>;

    /// Open a followed log stream for one container.
    async fn open_log(&self, pod: &PodKey, container: &str) -> AppResult<LogStream>;
}
