//! Warm pool of sandbox containers, one bounded pool per language.
//!
//! Every pool is guarded by its own mutex and no lock is held across an
//! `.await`: slow work (container creation, removal) happens after the
//! records have been claimed or detached under the lock. A record being
//! provisioned is already counted as busy, so the per-language bound holds
//! while creation is in flight.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use uuid::Uuid;

use crate::engine::{
    config::PoolConfig,
    error::EngineError,
    language::{LanguageProfile, LanguageRegistry, WORKSPACE_DIR},
    metrics::MetricsRegistry,
    models::{Language, PoolSnapshot},
    sandbox::{ContainerHandle, ContainerSpec, SandboxRuntime, shell},
    sanitize::sanitize,
};

#[derive(Debug)]
struct ContainerRecord {
    slot: u64,
    /// `None` while the container is still being provisioned.
    handle: Option<ContainerHandle>,
    busy: bool,
    last_used_at: Instant,
}

struct LanguagePool {
    limit: usize,
    records: Mutex<Vec<ContainerRecord>>,
}

impl LanguagePool {
    fn lock(&self) -> MutexGuard<'_, Vec<ContainerRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PoolInner {
    runtime: Arc<dyn SandboxRuntime>,
    config: PoolConfig,
    pools: HashMap<Language, LanguagePool>,
    metrics: Arc<MetricsRegistry>,
    next_slot: AtomicU64,
}

pub struct ContainerPool {
    inner: Arc<PoolInner>,
    shutdown: watch::Sender<bool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Exclusive use of one container until released. Dropping a lease releases
/// it, so a cancelled or panicking execution cannot leave a container busy.
pub struct ContainerLease {
    pool: Arc<PoolInner>,
    language: Language,
    slot: u64,
    handle: ContainerHandle,
    discard: bool,
}

impl ContainerLease {
    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// The container is destroyed on release instead of going back to idle.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        if self.discard {
            self.pool.discard_slot(self.language, self.slot);
        } else {
            self.pool.release_slot(self.language, self.slot);
        }
    }
}

/// Placeholder slot taken during provisioning; removed again on drop unless
/// the provisioned container was installed.
struct Reservation<'a> {
    pool: &'a PoolInner,
    language: Language,
    slot: u64,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.forget_slot(self.language, self.slot);
        }
    }
}

impl ContainerPool {
    /// Sweeps containers left over from a previous run, creates an empty pool
    /// per language and starts the maintenance loop.
    pub async fn initialize(
        runtime: Arc<dyn SandboxRuntime>,
        registry: &LanguageRegistry,
        config: PoolConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        sweep_leftovers(runtime.as_ref(), &config.container_prefix).await;

        let pools = registry
            .profiles()
            .map(|profile| {
                (
                    profile.language,
                    LanguagePool {
                        limit: profile.pool_size.max(1),
                        records: Mutex::new(Vec::new()),
                    },
                )
            })
            .collect();

        let inner = Arc::new(PoolInner {
            runtime,
            config,
            pools,
            metrics,
            next_slot: AtomicU64::new(1),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(maintenance_loop(inner.clone(), shutdown_rx));

        Self {
            inner,
            shutdown,
            maintenance: Mutex::new(Some(task)),
        }
    }

    pub async fn acquire(&self, profile: &LanguageProfile) -> Result<ContainerLease, EngineError> {
        let language = profile.language;
        let pool = self.inner.pool(language)?;

        let slot = {
            let mut records = pool.lock();
            let now = Instant::now();
            let idle = records.iter_mut().find_map(|record| {
                if record.busy {
                    return None;
                }
                let handle = record.handle.clone()?;
                record.busy = true;
                record.last_used_at = now;
                Some((record.slot, handle))
            });
            if let Some((slot, handle)) = idle {
                tracing::debug!(%language, container = %handle.name, "reusing warm container");
                return Ok(self.lease(language, slot, handle));
            }

            if records.len() >= pool.limit {
                tracing::debug!(%language, limit = pool.limit, "pool exhausted");
                return Err(EngineError::PoolExhausted(language));
            }

            let slot = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
            records.push(ContainerRecord {
                slot,
                handle: None,
                busy: true,
                last_used_at: now,
            });
            slot
        };

        let mut reservation = Reservation {
            pool: &self.inner,
            language,
            slot,
            armed: true,
        };
        let handle = self.inner.provision(profile).await?;

        let installed = {
            let mut records = pool.lock();
            match records.iter_mut().find(|record| record.slot == slot) {
                Some(record) => {
                    record.handle = Some(handle.clone());
                    record.last_used_at = Instant::now();
                    true
                }
                None => false,
            }
        };
        if !installed {
            // the pool was shut down while this container was being created
            self.inner.destroy(&handle).await;
            return Err(EngineError::Sandbox(format!(
                "{language} pool closed during provisioning"
            )));
        }

        reservation.armed = false;
        Ok(self.lease(language, slot, handle))
    }

    pub fn release(&self, lease: ContainerLease) {
        tracing::debug!(
            language = %lease.language(),
            container = %lease.handle().name,
            "releasing container"
        );
        drop(lease);
    }

    /// Destroys containers idle for longer than the configured idle timeout.
    /// Busy records are never touched. Returns how many were evicted.
    pub async fn maintenance(&self) -> usize {
        self.inner.evict_idle().await
    }

    pub fn busy_count(&self, language: Language) -> usize {
        self.inner
            .pools
            .get(&language)
            .map(|pool| pool.lock().iter().filter(|record| record.busy).count())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<PoolSnapshot> {
        let mut snapshots: Vec<PoolSnapshot> = self
            .inner
            .pools
            .iter()
            .map(|(language, pool)| {
                let records = pool.lock();
                let busy = records.iter().filter(|record| record.busy).count();
                PoolSnapshot {
                    language: *language,
                    limit: pool.limit,
                    total: records.len(),
                    busy,
                    idle: records.len() - busy,
                }
            })
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.language);
        snapshots
    }

    /// Stops maintenance and removes every container, busy or not.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let mut handles = Vec::new();
        for pool in self.inner.pools.values() {
            handles.extend(pool.lock().drain(..).filter_map(|record| record.handle));
        }
        tracing::info!(containers = handles.len(), "removing pooled containers");
        for handle in handles {
            self.inner.destroy(&handle).await;
        }
    }

    fn lease(&self, language: Language, slot: u64, handle: ContainerHandle) -> ContainerLease {
        ContainerLease {
            pool: self.inner.clone(),
            language,
            slot,
            handle,
            discard: false,
        }
    }
}

impl PoolInner {
    fn pool(&self, language: Language) -> Result<&LanguagePool, EngineError> {
        self.pools
            .get(&language)
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))
    }

    async fn provision(&self, profile: &LanguageProfile) -> Result<ContainerHandle, EngineError> {
        let language = profile.language;
        let spec = ContainerSpec {
            name: format!(
                "{}-{}-{}",
                self.config.container_prefix,
                language,
                Uuid::new_v4().simple()
            ),
            image: profile.image.to_string(),
            labels: HashMap::from([
                ("managed-by".to_string(), self.config.container_prefix.clone()),
                ("language".to_string(), language.to_string()),
            ]),
            limits: self.config.limits.clone(),
            network_disabled: self.config.network_disabled,
            auto_remove: true,
            working_dir: WORKSPACE_DIR.to_string(),
        };

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.provision_timeout;
        let timed_out = || {
            EngineError::Sandbox(format!(
                "{language} container not ready within {:?}",
                self.config.provision_timeout
            ))
        };

        let handle = match tokio::time::timeout_at(deadline, self.runtime.create(&spec)).await {
            Ok(created) => created.map_err(|err| EngineError::Sandbox(format!("{err:#}")))?,
            Err(_) => {
                // the daemon may still finish creating it under this name
                self.remove_named(&spec.name).await;
                return Err(timed_out());
            }
        };

        let prepared = tokio::time::timeout_at(deadline, self.prepare(&handle, profile))
            .await
            .unwrap_or_else(|_| Err(timed_out()));
        if let Err(err) = prepared {
            self.destroy(&handle).await;
            return Err(err);
        }

        self.metrics.container_created();
        tracing::info!(
            %language,
            container = %handle.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sandbox container ready"
        );
        Ok(handle)
    }

    async fn prepare(
        &self,
        handle: &ContainerHandle,
        profile: &LanguageProfile,
    ) -> Result<(), EngineError> {
        self.runtime
            .start(handle)
            .await
            .map_err(|err| EngineError::Sandbox(format!("{err:#}")))?;

        let workspace = format!("mkdir -p {WORKSPACE_DIR}");
        let steps = std::iter::once(workspace.as_str()).chain(profile.setup_commands.iter().copied());
        for step in steps {
            let output = self
                .runtime
                .exec(handle, &shell(step), None)
                .await
                .map_err(|err| EngineError::Sandbox(format!("setup `{step}` failed: {err:#}")))?;
            if !output.success() {
                return Err(EngineError::Sandbox(format!(
                    "setup `{step}` exited with status {}: {}",
                    output.exit_code,
                    sanitize(&output.stderr)
                )));
            }
        }
        Ok(())
    }

    async fn remove_named(&self, name: &str) {
        match self.runtime.list(name).await {
            Ok(handles) => {
                for handle in handles.iter().filter(|handle| handle.name == name) {
                    self.destroy(handle).await;
                }
            }
            Err(err) => {
                tracing::warn!(container = name, error = %format!("{err:#}"), "could not look up abandoned container")
            }
        }
    }

    async fn destroy(&self, handle: &ContainerHandle) {
        if let Err(err) = self.runtime.remove(handle).await {
            tracing::warn!(container = %handle.name, error = %format!("{err:#}"), "failed to remove container");
        }
    }

    async fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut evicted = Vec::new();
        for (language, pool) in &self.pools {
            let mut records = pool.lock();
            let now = Instant::now();
            let (stale, kept): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *records).into_iter().partition(|record| {
                    !record.busy
                        && record.handle.is_some()
                        && now.duration_since(record.last_used_at) > idle_timeout
                });
            *records = kept;
            evicted.extend(
                stale
                    .into_iter()
                    .filter_map(|record| record.handle)
                    .map(|handle| (*language, handle)),
            );
        }

        for (language, handle) in &evicted {
            tracing::info!(%language, container = %handle.name, "evicting idle container");
            self.destroy(handle).await;
        }
        if !evicted.is_empty() {
            self.metrics.containers_evicted(evicted.len());
        }
        evicted.len()
    }

    fn release_slot(&self, language: Language, slot: u64) {
        let Some(pool) = self.pools.get(&language) else {
            return;
        };
        let mut records = pool.lock();
        match records.iter_mut().find(|record| record.slot == slot) {
            Some(record) => {
                record.busy = false;
                record.last_used_at = Instant::now();
            }
            None => tracing::debug!(%language, slot, "released slot no longer pooled"),
        }
    }

    fn forget_slot(&self, language: Language, slot: u64) {
        if let Some(pool) = self.pools.get(&language) {
            pool.lock().retain(|record| record.slot != slot);
        }
    }

    fn discard_slot(&self, language: Language, slot: u64) {
        let Some(pool) = self.pools.get(&language) else {
            return;
        };
        let handle = {
            let mut records = pool.lock();
            let position = records.iter().position(|record| record.slot == slot);
            position.and_then(|index| records.remove(index).handle)
        };
        let Some(handle) = handle else {
            return;
        };

        tracing::warn!(%language, container = %handle.name, "discarding unhealthy container");
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(err) = runtime.remove(&handle).await {
                        tracing::warn!(container = %handle.name, error = %format!("{err:#}"), "failed to remove container");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(container = %handle.name, "no runtime to remove discarded container")
            }
        }
    }
}

async fn sweep_leftovers(runtime: &dyn SandboxRuntime, prefix: &str) {
    let leftovers = match runtime.list(&format!("{prefix}-")).await {
        Ok(leftovers) => leftovers,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "could not list leftover containers");
            return;
        }
    };
    if leftovers.is_empty() {
        return;
    }

    tracing::info!(count = leftovers.len(), prefix, "removing leftover sandbox containers");
    for handle in leftovers {
        if let Err(err) = runtime.remove(&handle).await {
            tracing::warn!(container = %handle.name, error = %format!("{err:#}"), "failed to remove leftover container");
        }
    }
}

async fn maintenance_loop(inner: Arc<PoolInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.maintenance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = inner.evict_idle().await;
                if evicted > 0 {
                    tracing::info!(evicted, "pool maintenance finished");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("pool maintenance stopped");
}
