//! Live set of worker connections and the selection operations over it.
//!
//! A worker enters the registry only after its connection handshake
//! succeeded and leaves it when its connection's lifetime ends: a monitor
//! task per worker waits on the worker's cancellation and calls
//! [`WorkerRegistry::self_unregister_worker`]. Standalone workers configured
//! at startup are never removed this way.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{AddressMap, ManagerConfig, PeerManager};
use crate::error::{FleetError, Result};
use crate::key_lock::KeyLock;
use crate::selection::{hash_index, pick_by_rendezvous, pick_random};
use crate::workers::{Worker, WorkerHandle, WorkerSettings, WorkerType};

/// Point-in-time view of one registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub worker_type: WorkerType,
    pub address: String,
    pub healthy: bool,
    pub accepting_jobs: bool,
    pub standalone: bool,
    pub registered_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    workers: HashMap<String, Arc<Worker>>,
    // registration order per type; hash picks index into it
    by_type: HashMap<WorkerType, Vec<String>>,
    standalone: HashSet<String>,
}

impl RegistryState {
    fn insert(&mut self, worker: Arc<Worker>, standalone: bool) {
        let worker_id = worker.worker_id().to_string();
        self.by_type
            .entry(worker.worker_type())
            .or_default()
            .push(worker_id.clone());
        if standalone {
            self.standalone.insert(worker_id.clone());
        }
        self.workers.insert(worker_id, worker);
    }

    fn remove(&mut self, worker_id: &str) -> Option<Arc<Worker>> {
        let worker = self.workers.remove(worker_id)?;
        let worker_type = worker.worker_type();
        if let Some(ids) = self.by_type.get_mut(&worker_type) {
            ids.retain(|id| id != worker_id);
            if ids.is_empty() {
                self.by_type.remove(&worker_type);
            }
        }
        self.standalone.remove(worker_id);
        Some(worker)
    }

    fn of_type(&self, worker_type: WorkerType) -> Vec<Arc<Worker>> {
        self.by_type
            .get(&worker_type)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.workers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct Inner {
    settings: WorkerSettings,
    address_map: AddressMap,
    managers: Vec<PeerManager>,
    cancel: CancellationToken,
    registration: KeyLock<String>,
    state: Mutex<RegistryState>,
}

/// Thread-safe worker registry. Cloning yields another handle to the same
/// registry.
#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<Inner>,
}

impl WorkerRegistry {
    pub fn new(
        settings: WorkerSettings,
        address_map: AddressMap,
        managers: Vec<PeerManager>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                address_map,
                managers,
                cancel: CancellationToken::new(),
                registration: KeyLock::new(),
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Registry for a manager: the roster lists this manager first, then
    /// its peers.
    pub fn from_config(config: &ManagerConfig) -> Self {
        let mut managers = vec![PeerManager {
            id: config.manager_id.clone(),
            address: config.advertise_addr.clone(),
        }];
        managers.extend(config.peers.iter().cloned());

        Self::new(
            WorkerSettings {
                connection: config.connection.clone(),
                run: config.run.clone(),
            },
            config.address_map.clone(),
            managers,
        )
    }

    /// Connect to a worker and add it to the live set.
    ///
    /// Registering an id that is already live is a no-op. Concurrent
    /// registrations of the same id are serialized so only one connection is
    /// made.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        address: &str,
        worker_type: WorkerType,
    ) -> Result<()> {
        if worker_id.trim().is_empty() {
            return Err(FleetError::InvalidConfig("worker id is empty".to_string()));
        }
        if address.trim().is_empty() {
            return Err(FleetError::InvalidConfig(format!(
                "worker {} has no address",
                worker_id
            )));
        }

        let _guard = self.inner.registration.guard(worker_id.to_string()).await;
        if self.state().workers.contains_key(worker_id) {
            tracing::debug!(worker_id, "Worker already registered");
            return Ok(());
        }

        let worker = self.connect(worker_type, worker_id, address).await?;
        self.state().insert(worker.clone(), false);
        self.spawn_monitor(&worker);

        tracing::info!(
            worker_id,
            worker_type = %worker_type,
            address = %worker.address(),
            "Worker registered"
        );
        Ok(())
    }

    /// Connect to a worker configured at startup. It gets a generated id and
    /// stays registered when its connection ends.
    pub async fn register_standalone(
        &self,
        worker_type: WorkerType,
        address: &str,
    ) -> Result<String> {
        let worker_id = Uuid::new_v4().to_string();
        let worker = self.connect(worker_type, &worker_id, address).await?;
        self.state().insert(worker, true);

        tracing::info!(
            worker_id = %worker_id,
            worker_type = %worker_type,
            address,
            "Standalone worker registered"
        );
        Ok(worker_id)
    }

    async fn connect(
        &self,
        worker_type: WorkerType,
        worker_id: &str,
        address: &str,
    ) -> Result<Arc<Worker>> {
        let resolved = self.inner.address_map.resolve(address);
        if resolved != address {
            tracing::debug!(worker_id, address, resolved = %resolved, "Remapped worker address");
        }

        let worker = Arc::new(Worker::new(
            worker_type,
            worker_id,
            &resolved,
            &self.inner.settings,
            &self.inner.cancel,
        ));
        worker.start().await?;
        Ok(worker)
    }

    fn spawn_monitor(&self, worker: &Arc<Worker>) {
        let registry = Arc::downgrade(&self.inner);
        let instance = Arc::downgrade(worker);
        let worker_id = worker.worker_id().to_string();
        let lifetime = worker.connection().child_token();

        tokio::spawn(async move {
            lifetime.cancelled().await;
            if let Some(inner) = registry.upgrade() {
                WorkerRegistry { inner }.unregister_instance(&worker_id, &instance);
            }
        });
    }

    /// Remove `worker_id` only if it still refers to the instance the monitor
    /// was watching; a re-registration under the same id must survive.
    fn unregister_instance(&self, worker_id: &str, instance: &Weak<Worker>) {
        let current = self.state().workers.get(worker_id).cloned();
        match current {
            Some(current) if std::ptr::eq(Arc::as_ptr(&current), instance.as_ptr()) => {
                self.self_unregister_worker(worker_id);
            }
            _ => {
                tracing::debug!(worker_id, "Stale monitor for replaced worker");
            }
        }
    }

    /// Remove a worker whose connection ended and stop it. Unknown ids and
    /// standalone workers are left alone.
    pub fn self_unregister_worker(&self, worker_id: &str) {
        let removed = {
            let mut state = self.state();
            if state.standalone.contains(worker_id) {
                tracing::debug!(worker_id, "Not unregistering standalone worker");
                return;
            }
            state.remove(worker_id)
        };

        if let Some(worker) = removed {
            worker.stop();
            tracing::info!(
                worker_id,
                worker_type = %worker.worker_type(),
                "Worker unregistered"
            );
        }
    }

    pub fn get_worker(&self, worker_id: &str) -> Option<Arc<Worker>> {
        self.state().workers.get(worker_id).cloned()
    }

    pub fn list_workers(&self) -> Vec<WorkerSummary> {
        let state = self.state();
        let mut summaries: Vec<_> = state
            .workers
            .values()
            .map(|worker| WorkerSummary {
                worker_id: worker.worker_id().to_string(),
                worker_type: worker.worker_type(),
                address: worker.address().to_string(),
                healthy: worker.is_healthy(),
                accepting_jobs: worker.is_accepting_jobs(),
                standalone: state.standalone.contains(worker.worker_id()),
                registered_at: worker.connection().registered_at(),
            })
            .collect();
        summaries.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        summaries
    }

    /// Workers of one type in registration order.
    pub fn list_workers_by_type(&self, worker_type: WorkerType) -> Vec<Arc<Worker>> {
        self.state().of_type(worker_type)
    }

    fn eligible(&self, worker_type: WorkerType) -> Vec<Arc<Worker>> {
        let mut workers = self.list_workers_by_type(worker_type);
        workers.retain(|worker| worker.is_eligible());
        workers
    }

    /// Uniform choice among healthy workers of `worker_type` that accept jobs.
    pub fn pick_worker_randomly(&self, worker_type: WorkerType) -> Option<Arc<Worker>> {
        pick_random(&self.eligible(worker_type)).cloned()
    }

    /// Rendezvous choice among eligible workers of `worker_type`: the same key
    /// maps to the same worker while that worker stays eligible.
    pub fn pick_worker_by_key(&self, key: &str, worker_type: WorkerType) -> Option<Arc<Worker>> {
        let candidates = self.eligible(worker_type);
        pick_by_rendezvous(key.as_bytes(), &candidates, |worker| worker.worker_id()).cloned()
    }

    /// Bucket `data` onto the registered workers of `worker_type`, walking
    /// forward from the bucket to the first eligible one.
    pub fn pick_worker_by_hash(&self, worker_type: WorkerType, data: &[u8]) -> Option<Arc<Worker>> {
        let workers = self.list_workers_by_type(worker_type);
        let start = hash_index(data, workers.len())?;
        (0..workers.len())
            .map(|offset| &workers[(start + offset) % workers.len()])
            .find(|worker| worker.is_eligible())
            .cloned()
    }

    /// Managers known to this one, itself first.
    pub fn list_managers(&self) -> Vec<PeerManager> {
        self.inner.managers.clone()
    }

    pub fn len(&self) -> usize {
        self.state().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().workers.is_empty()
    }

    /// Stop every worker, standalone ones included, and empty the registry.
    pub fn stop(&self) {
        let workers: Vec<_> = {
            let mut state = self.state();
            state.by_type.clear();
            state.standalone.clear();
            state.workers.drain().map(|(_, worker)| worker).collect()
        };

        for worker in &workers {
            worker.stop();
        }
        self.inner.cancel.cancel();
        tracing::info!(stopped = workers.len(), "Worker registry stopped");
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(
            WorkerSettings {
                connection: ConnectionConfig {
                    connect_timeout_ms: 200,
                    ..Default::default()
                },
                ..Default::default()
            },
            AddressMap::default(),
            vec![PeerManager {
                id: "m-1".to_string(),
                address: "127.0.0.1:50050".to_string(),
            }],
        )
    }

    #[tokio::test]
    async fn empty_registry_finds_nothing() {
        let registry = registry();
        assert!(registry.is_empty());
        assert!(registry.get_worker("w1").is_none());
        assert!(registry.pick_worker_randomly(WorkerType::Runner).is_none());
        assert!(registry.pick_worker_by_key("session", WorkerType::Runner).is_none());
        assert!(registry
            .pick_worker_by_hash(WorkerType::Runner, b"image")
            .is_none());
        assert!(registry.list_workers_by_type(WorkerType::Launcher).is_empty());
    }

    #[tokio::test]
    async fn unknown_unregister_is_noop() {
        let registry = registry();
        registry.self_unregister_worker("missing");
        registry.self_unregister_worker("missing");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn failed_handshake_is_not_registered() {
        let registry = registry();
        let result = registry
            .register_worker("w1", "127.0.0.1:1", WorkerType::Runner)
            .await;
        assert!(result.is_err());
        assert!(registry.get_worker("w1").is_none());
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let registry = registry();
        let result = registry
            .register_worker("  ", "127.0.0.1:1", WorkerType::Runner)
            .await;
        assert!(matches!(result, Err(FleetError::InvalidConfig(_))));
    }

    #[test]
    fn managers_from_config_list_self_first() {
        let config = ManagerConfig::default().with_peer("m-2", "10.0.0.2:50050");
        let registry = WorkerRegistry::from_config(&config);
        let managers = registry.list_managers();
        assert_eq!(managers.len(), 2);
        assert_eq!(managers[0].id, config.manager_id);
        assert_eq!(managers[0].address, config.advertise_addr);
        assert_eq!(managers[1].id, "m-2");
    }
}
