use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::backoff::sleep_or_cancel;
use crate::cluster::Cluster;
use crate::errors::{AppError, AppResult};
use crate::types::{BuildRef, PodDescriptor};

#[derive(Clone, Copy, Debug)]
pub struct LocateOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for LocateOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Polls until exactly one pod backs `build`.
///
/// More than one candidate is a misconfiguration and fails at once. Listing
/// errors are logged and polled through until the timeout.
pub async fn locate(
    cluster: &dyn Cluster,
    build: &BuildRef,
    opts: LocateOptions,
    cancel: &CancellationToken,
) -> AppResult<PodDescriptor> {
    let deadline = Instant::now() + opts.timeout;

    loop {
        let found = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            r = timeout_at(deadline, cluster.find_pods(build)) => match r {
                Ok(found) => found,
                Err(_) => return Err(not_found(build, opts)),
            },
        };

        match found {
            Ok(mut pods) if pods.len() == 1 => {
                let pod = pods.remove(0);
                tracing::debug!(
                    namespace = %pod.key.namespace,
                    pod = %pod.key.name,
                    steps = pod.containers.len(),
                    "located build pod"
                );
                return Ok(pod);
            }
            Ok(pods) if pods.len() > 1 => {
                return Err(AppError::Ambiguous {
                    build: build.to_string(),
                    pods: pods.into_iter().map(|p| p.key.name).collect(),
                });
            }
            Ok(_) => {
                tracing::debug!(build = %build, "no build pod yet");
            }
            Err(e) => {
                tracing::warn!(build = %build, error = %e, "listing build pods failed; retrying");
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(not_found(build, opts));
        }

        let wait = std::cmp::min(opts.interval, deadline - now);
        if !sleep_or_cancel(wait, cancel).await {
            return Err(AppError::Cancelled);
        }
    }
}

fn not_found(build: &BuildRef, opts: LocateOptions) -> AppError {
    AppError::NotFound {
        build: build.to_string(),
        timeout: opts.timeout,
    }
}
