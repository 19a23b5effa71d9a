//! Service supervisor for the vector and graph store containers.
//!
//! Selecting a concrete container runtime (docker, podman, ...) is out of
//! scope here; [`ContainerRuntime`] is an injectable seam so the caller can
//! wire in whichever runtime it has, or a no-op stub in tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{ConduitError, Result};
use crate::vector_store::VectorStore;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Missing,
    Stopped,
    Running,
}

/// Lifecycle operations for a single managed container (vector or graph
/// store). Implementations talk to whatever runtime is actually installed.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn state(&self, service: &str) -> Result<ContainerState>;
    async fn create(&self, service: &str) -> Result<()>;
    async fn start(&self, service: &str) -> Result<()>;
    async fn is_healthy(&self, service: &str) -> Result<bool>;
}

/// No-op runtime: reports services as already running and healthy. Useful
/// when the vector/graph stores are managed outside this process (e.g. a
/// docker-compose stack started independently), and as a grounding stub
/// until a concrete runtime is wired in.
pub struct NoopContainerRuntime;

#[async_trait]
impl ContainerRuntime for NoopContainerRuntime {
    async fn state(&self, _service: &str) -> Result<ContainerState> {
        Ok(ContainerState::Running)
    }

    async fn create(&self, _service: &str) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _service: &str) -> Result<()> {
        Ok(())
    }

    async fn is_healthy(&self, _service: &str) -> Result<bool> {
        Ok(true)
    }
}

pub struct ServiceSupervisor<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub vector_store: Option<&'a VectorStore>,
}

impl<'a> ServiceSupervisor<'a> {
    /// Ensure `service` is created, started, and reports healthy, polling
    /// until `HEALTH_TIMEOUT` elapses.
    pub async fn ensure_ready(&self, service: &str) -> Result<()> {
        match self.runtime.state(service).await? {
            ContainerState::Missing => {
                info!("container for {service} missing, creating");
                self.runtime.create(service).await?;
                self.runtime.start(service).await?;
            }
            ContainerState::Stopped => {
                info!("container for {service} stopped, starting");
                self.runtime.start(service).await?;
            }
            ContainerState::Running => {}
        }

        let deadline = tokio::time::Instant::now() + HEALTH_TIMEOUT;
        loop {
            if self.runtime.is_healthy(service).await.unwrap_or(false) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConduitError::Timeout(format!(
                    "{service} did not become healthy within {}s",
                    HEALTH_TIMEOUT.as_secs()
                )));
            }
            sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Delete and recreate the named vector collection, e.g. after a corrupt
    /// index or a dimension change in the embedding model.
    pub async fn purge_vector_collection(&self, name: &str, dims: u64) -> Result<()> {
        let vector_store = self
            .vector_store
            .ok_or_else(|| ConduitError::SemanticUnavailable("no vector store configured".into()))?;
        warn!("purging vector collection {name}");
        vector_store.purge_collection(name, dims).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyRuntime {
        healthy_after: AtomicU32,
    }

    #[async_trait]
    impl ContainerRuntime for FlakyRuntime {
        async fn state(&self, _service: &str) -> Result<ContainerState> {
            Ok(ContainerState::Stopped)
        }

        async fn create(&self, _service: &str) -> Result<()> {
            Ok(())
        }

        async fn start(&self, _service: &str) -> Result<()> {
            Ok(())
        }

        async fn is_healthy(&self, _service: &str) -> Result<bool> {
            let attempts = self.healthy_after.fetch_sub(1, Ordering::Relaxed);
            Ok(attempts <= 1)
        }
    }

    #[tokio::test]
    async fn noop_runtime_is_immediately_ready() {
        let runtime = NoopContainerRuntime;
        let supervisor = ServiceSupervisor { runtime: &runtime, vector_store: None };
        supervisor.ensure_ready("qdrant").await.unwrap();
    }

    #[tokio::test]
    async fn polls_until_healthy() {
        let runtime = FlakyRuntime { healthy_after: AtomicU32::new(3) };
        let supervisor = ServiceSupervisor { runtime: &runtime, vector_store: None };
        supervisor.ensure_ready("falkordb").await.unwrap();
    }
}
