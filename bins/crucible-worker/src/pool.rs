// Sandbox pool: a fixed-size set of pre-started sandboxes per
// language, reused across tasks. All slot state lives behind one
// mutex so allocation, release, and the health checker never race on
// the same slot.

use crate::errors::PoolError;
use crate::languages;
use crate::sandbox::SandboxRuntime;
use crucible_common::config::Config;
use crucible_common::types::Language;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reserved name prefix for pool sandboxes; anything matching it on
/// startup is an orphan from a previous crash.
pub const POOL_NAME_PREFIX: &str = "crucible-pool-";

/// How long an allocation waits before re-scanning the pool even
/// without a release notification; covers slots added by a refill.
const ALLOCATE_RECHECK_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug)]
struct SandboxSlot {
    id: Uuid,
    handle: String,
    name: String,
    busy: bool,
    last_used: Instant,
}

/// Exclusive claim on one sandbox for the duration of one task.
#[derive(Debug, Clone)]
pub struct SlotLease {
    pub id: Uuid,
    pub handle: String,
    pub language: Language,
}

struct PoolInner {
    runtime: SandboxRuntime,
    pools: Mutex<HashMap<Language, Vec<SandboxSlot>>>,
    released: Notify,
    languages: Vec<Language>,
    pool_size: usize,
    health_interval: Duration,
}

#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    pub fn new(runtime: SandboxRuntime, config: &Config) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                runtime,
                pools: Mutex::new(HashMap::new()),
                released: Notify::new(),
                languages: config.languages.clone(),
                pool_size: config.worker.concurrency as usize,
                health_interval: config.worker.health_check_interval,
            }),
        }
    }

    /// Purge orphans left by a previous crash, fill every configured
    /// language's pool, start the recurring health check.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        self.purge_orphans().await;

        {
            let mut pools = self.inner.pools.lock().await;
            for language in &self.inner.languages {
                pools.entry(*language).or_default();
            }
        }

        for language in self.inner.languages.clone() {
            self.ensure_pool_size(language).await?;
        }

        self.spawn_health_loop();
        Ok(())
    }

    async fn purge_orphans(&self) {
        match self.inner.runtime.list_all(POOL_NAME_PREFIX).await {
            Ok(names) => {
                for name in names {
                    match self.inner.runtime.remove(&name).await {
                        Ok(()) => info!(container = %name, "removed orphaned sandbox"),
                        Err(e) => {
                            warn!(container = %name, error = %e, "failed to remove orphaned sandbox")
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to enumerate orphaned sandboxes"),
        }
    }

    /// Pull the language image if needed and create sandboxes until
    /// the pool is at its configured size. No-op when already full;
    /// never exceeds the bound even against a concurrent refill.
    pub async fn ensure_pool_size(&self, language: Language) -> Result<(), PoolError> {
        let deficit = {
            let pools = self.inner.pools.lock().await;
            let slots = pools.get(&language).ok_or(PoolError::NoPool(language))?;
            self.inner.pool_size.saturating_sub(slots.len())
        };
        if deficit == 0 {
            return Ok(());
        }

        let image = languages::image_for(language);
        self.inner.runtime.pull_image(image).await?;

        for _ in 0..deficit {
            let id = Uuid::new_v4();
            let name = format!("{}{}-{}", POOL_NAME_PREFIX, language, id);
            let handle = self.inner.runtime.create_and_start(image, &name).await?;

            let mut pools = self.inner.pools.lock().await;
            let slots = pools.get_mut(&language).ok_or(PoolError::NoPool(language))?;
            if slots.len() >= self.inner.pool_size {
                // a concurrent refill won; drop the extra sandbox
                drop(pools);
                let _ = self.inner.runtime.remove(&name).await;
                break;
            }
            debug!(container = %name, language = %language, "sandbox added to pool");
            slots.push(SandboxSlot {
                id,
                handle,
                name,
                busy: false,
                last_used: Instant::now(),
            });
            drop(pools);
            self.inner.released.notify_waiters();
        }

        Ok(())
    }

    /// Claim a free sandbox for `language`. When the pool is
    /// saturated, suspends until a release (or the recheck interval)
    /// and retries; the caller's own timeout or cancellation bounds
    /// the wait. This is the backpressure point.
    pub async fn allocate(&self, language: Language) -> Result<SlotLease, PoolError> {
        loop {
            {
                let mut pools = self.inner.pools.lock().await;
                let slots = pools.get_mut(&language).ok_or(PoolError::NoPool(language))?;
                if let Some(slot) = take_free_slot(slots) {
                    return Ok(SlotLease {
                        id: slot.id,
                        handle: slot.handle.clone(),
                        language,
                    });
                }
            }
            let _ = tokio::time::timeout(ALLOCATE_RECHECK_INTERVAL, self.inner.released.notified())
                .await;
        }
    }

    /// Return a sandbox to the pool. Invoked on every path, success or
    /// failure, so a faulted execution cannot strand a slot as busy.
    pub async fn release(&self, lease: &SlotLease) {
        {
            let mut pools = self.inner.pools.lock().await;
            if let Some(slots) = pools.get_mut(&lease.language) {
                if let Some(slot) = slots.iter_mut().find(|s| s.id == lease.id) {
                    slot.busy = false;
                    slot.last_used = Instant::now();
                }
            }
        }
        self.inner.released.notify_one();
    }

    fn spawn_health_loop(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.inner.health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                pool.health_check().await;
            }
        });
    }

    /// Probe every slot, remove dead ones, then refill every pool to
    /// its configured size. The refill runs unconditionally so a
    /// deficit left by an earlier failed refill heals within one pass.
    /// Liveness probes run outside the lock; removal re-checks state
    /// under the lock so a slot handed to an allocator in the meantime
    /// is left alone and caught by a later pass.
    pub async fn health_check(&self) {
        let candidates: Vec<(Language, Uuid, String)> = {
            let pools = self.inner.pools.lock().await;
            pools
                .iter()
                .flat_map(|(language, slots)| {
                    slots
                        .iter()
                        .map(|s| (*language, s.id, s.handle.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (language, id, handle) in candidates {
            if self.inner.runtime.inspect_running(&handle).await {
                continue;
            }

            let removed = {
                let mut pools = self.inner.pools.lock().await;
                let slots = match pools.get_mut(&language) {
                    Some(slots) => slots,
                    None => continue,
                };
                match slots.iter().position(|s| s.id == id && !s.busy) {
                    Some(idx) => Some(slots.remove(idx).name),
                    None => None,
                }
            };

            if let Some(name) = removed {
                warn!(container = %name, language = %language, "removing unhealthy sandbox");
                if let Err(e) = self.inner.runtime.remove(&name).await {
                    warn!(container = %name, error = %e, "failed to remove unhealthy sandbox");
                }
            }
        }

        for language in self.inner.languages.clone() {
            if let Err(e) = self.ensure_pool_size(language).await {
                error!(language = %language, error = %e, "failed to refill pool");
            }
        }
    }

    /// Remove every sandbox in every pool. Called on shutdown, after
    /// in-flight executions have drained.
    pub async fn shutdown(&self) {
        info!("removing sandbox pools");
        let mut pools = self.inner.pools.lock().await;
        for (language, slots) in pools.iter_mut() {
            for slot in slots.drain(..) {
                if let Err(e) = self.inner.runtime.remove(&slot.name).await {
                    warn!(container = %slot.name, language = %language, error = %e, "failed to remove sandbox");
                }
            }
        }
    }
}

/// Mark the first non-busy slot busy and return it.
fn take_free_slot(slots: &mut [SandboxSlot]) -> Option<&mut SandboxSlot> {
    let slot = slots.iter_mut().find(|s| !s.busy)?;
    slot.busy = true;
    slot.last_used = Instant::now();
    Some(slot)
}
