use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use sandbox_runtime::SandboxRuntime;

use crate::config::SandboxConfig;
use crate::metrics::ServerMetrics;

use super::actor::{SandboxActor, SandboxHandle};
use super::state::SandboxState;

/// Builds the runtime a new controller drives, given the workspace id
pub type RuntimeFactory = Arc<dyn Fn(&str) -> Arc<dyn SandboxRuntime> + Send + Sync>;

/// At most one controller per workspace, created on first use and shared by
/// every session of that workspace. Controllers outlive connections.
pub struct SandboxRegistry {
    controllers: RwLock<HashMap<String, SandboxHandle>>,
    factory: RuntimeFactory,
    config: SandboxConfig,
    metrics: Arc<ServerMetrics>,
}

impl SandboxRegistry {
    pub fn new(factory: RuntimeFactory, config: SandboxConfig, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            controllers: RwLock::new(HashMap::new()),
            factory,
            config,
            metrics,
        }
    }

    pub async fn get(&self, workspace_id: &str) -> Option<SandboxHandle> {
        self.controllers.read().await.get(workspace_id).cloned()
    }

    pub async fn get_or_create(&self, workspace_id: &str) -> SandboxHandle {
        if let Some(handle) = self.get(workspace_id).await {
            return handle;
        }

        let mut controllers = self.controllers.write().await;
        // Another session may have created it while we waited for the lock
        if let Some(handle) = controllers.get(workspace_id) {
            return handle.clone();
        }

        let runtime = (self.factory)(workspace_id);
        let handle = SandboxActor::spawn(
            workspace_id,
            runtime,
            self.config.clone(),
            self.metrics.clone(),
        );
        info!("Created sandbox controller for workspace {}", workspace_id);
        controllers.insert(workspace_id.to_string(), handle.clone());
        handle
    }

    pub async fn len(&self) -> usize {
        self.controllers.read().await.len()
    }

    /// Controllers whose instance is starting or serving
    pub async fn running_count(&self) -> usize {
        self.controllers
            .read()
            .await
            .values()
            .filter(|h| h.status().state.is_active())
            .count()
    }

    /// Stop every live instance (server shutdown)
    pub async fn shutdown(&self) {
        let handles: Vec<SandboxHandle> = self.controllers.read().await.values().cloned().collect();
        for handle in handles {
            if handle.status().state != SandboxState::Idle {
                info!("Stopping sandbox for workspace {}", handle.workspace_id());
            }
            let _ = handle.kill().await;
        }
    }
}
