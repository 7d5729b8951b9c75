//! Resource controller.
//!
//! A single loop samples every tracked sandbox, nudges its memory/CPU quota
//! up or down within the language bounds, and reaps sandboxes that are idle
//! or failing runtime RPCs. The tick snapshots the tables under the lock,
//! does all RPC work unlocked, then re-acquires the lock to apply staged
//! updates and removals — a sandbox created mid-tick is simply picked up
//! next time.

use std::sync::Arc;
use std::time::Instant;

use runtime::{ContainerRuntime, ResourceUpdate};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::{decrement_running, remove_seat, Pool};

/// Run [`Pool::rebalance`] every monitoring interval until shutdown.
pub async fn monitor_loop<R: ContainerRuntime>(pool: Arc<Pool<R>>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(pool.config().monitoring_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => pool.rebalance().await,
        }
    }
    debug!("resource controller stopped");
}

impl<R: ContainerRuntime> Pool<R> {
    /// One controller tick over a snapshot of the tracked sandboxes.
    pub async fn rebalance(&self) {
        let tracked: Vec<_> = {
            let state = self.state.lock().await;
            state
                .resources
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };
        if tracked.is_empty() {
            return;
        }
        let started = Instant::now();

        let mut staged: Vec<(String, ResourceUpdate)> = Vec::new();
        let mut doomed: Vec<String> = Vec::new();

        for (id, entry) in tracked {
            let Ok(spec) = self.catalog.get(&entry.lang) else {
                continue;
            };

            let stats = match self.runtime.sandbox_stats(&id).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(sandbox_id = %id, error = %e, "stats query failed, reaping");
                    doomed.push(id);
                    continue;
                }
            };

            let mem_pct = stats.memory_percent();
            let cpu_pct = stats.cpu_percent();
            let high = self.config.high_threshold;
            let low = self.config.low_threshold;

            let mut new_mem = entry.memory;
            let mut new_cpu = entry.cpu;
            let mut changed = false;

            if mem_pct > high && entry.memory < spec.max_mem {
                new_mem = (entry.memory + spec.incr_mem).min(spec.max_mem);
                changed = true;
            } else if mem_pct < low && entry.memory > spec.min_mem {
                new_mem = (entry.memory - spec.incr_mem).max(spec.min_mem);
                changed = true;
            }

            if cpu_pct > high && entry.cpu < spec.max_cpu {
                new_cpu = (entry.cpu + spec.incr_cpu).min(spec.max_cpu);
                changed = true;
            } else if cpu_pct < low && entry.cpu > spec.min_cpu {
                new_cpu = (entry.cpu - spec.incr_cpu).max(spec.min_cpu);
                changed = true;
            }

            // An idle sandbox is reaped, not rescaled.
            if mem_pct < spec.mem_idle_threshold && cpu_pct < spec.cpu_idle_threshold {
                info!(sandbox_id = %id, mem_pct, cpu_pct, "sandbox idle, reaping");
                doomed.push(id);
                continue;
            }

            if changed {
                let update = ResourceUpdate {
                    memory: new_mem,
                    cpu: new_cpu,
                };
                match self.runtime.update_resources(&id, update).await {
                    Ok(()) => {
                        info!(
                            sandbox_id = %id,
                            memory = new_mem,
                            cpu = new_cpu,
                            "rescaled sandbox"
                        );
                        staged.push((id, update));
                    }
                    Err(e) => {
                        warn!(sandbox_id = %id, error = %e, "resource update failed, reaping");
                        doomed.push(id);
                    }
                }
            }
        }

        let removed: Vec<String> = {
            let mut state = self.state.lock().await;
            for (id, update) in staged {
                if let Some(entry) = state.resources.get_mut(&id) {
                    entry.memory = update.memory;
                    entry.cpu = update.cpu;
                }
            }
            let mut removed = Vec::new();
            for id in doomed {
                if let Some(entry) = state.resources.remove(&id) {
                    remove_seat(&mut state.reusable, &entry.lang, &id);
                    remove_seat(&mut state.full, &entry.lang, &id);
                    decrement_running(&mut state.running, &entry.lang);
                    removed.push(id);
                }
            }
            removed
        };

        for id in &removed {
            self.destroy(id).await;
        }

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "resource check finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::PoolConfig;
    use crate::paths::HostPaths;
    use runtime::testing::InMemoryRuntime;
    use runtime::SandboxStats;
    use std::path::PathBuf;

    const MIB: i64 = 1024 * 1024;

    fn pool() -> Pool<InMemoryRuntime> {
        let catalog = Catalog::builtin(&HostPaths::new(PathBuf::from("/tmp/monitor-test")));
        Pool::new(
            Arc::new(InMemoryRuntime::new()),
            Arc::new(catalog),
            PoolConfig::default(),
        )
    }

    /// Sample with the given percentages against a fixed base.
    fn stats(mem_pct: u64, cpu_pct: u64) -> SandboxStats {
        SandboxStats {
            memory_usage: mem_pct,
            memory_limit: 100,
            cpu_delta: cpu_pct,
            system_delta: 100,
            online_cpus: 1,
        }
    }

    #[tokio::test]
    async fn high_memory_scales_up_by_one_increment() {
        let pool = pool();
        let id = pool.acquire("py").await.expect("acquire");
        // 95% memory, CPU in the dead zone.
        pool.runtime.set_stats(&id, stats(95, 50));

        pool.rebalance().await;

        let updates = pool.runtime.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, id);
        assert_eq!(updates[0].1.memory, 228 * MIB);
        assert_eq!(updates[0].1.cpu, 1);

        let snap = pool.snapshot().await;
        assert_eq!(snap.resources[&id].memory, 228 * MIB);
    }

    #[tokio::test]
    async fn low_usage_scales_down_but_not_below_min() {
        let pool = pool();
        let id = pool.acquire("py").await.expect("acquire");
        // Below the low threshold but above the idle thresholds.
        pool.runtime.set_stats(&id, stats(25, 20));

        pool.rebalance().await;

        // Already at the language minimum; nothing to shrink.
        assert!(pool.runtime.updates().is_empty());
        let snap = pool.snapshot().await;
        assert_eq!(snap.resources[&id].memory, 128 * MIB);
    }

    #[tokio::test]
    async fn repeated_pressure_saturates_at_max() {
        let pool = pool();
        let id = pool.acquire("py").await.expect("acquire");
        pool.runtime.set_stats(&id, stats(95, 95));

        for _ in 0..12 {
            pool.rebalance().await;
        }

        let snap = pool.snapshot().await;
        assert_eq!(snap.resources[&id].memory, 1024 * MIB);
        assert_eq!(snap.resources[&id].cpu, 2);
        for (_, update) in pool.runtime.updates() {
            assert!(update.memory <= 1024 * MIB);
            assert!(update.cpu <= 2);
        }
    }

    #[tokio::test]
    async fn idle_sandbox_is_reaped_not_rescaled() {
        let pool = pool();
        let id = pool.acquire("py").await.expect("acquire");
        // Below both idle thresholds (15% mem, 5% cpu for py).
        pool.runtime.set_stats(&id, stats(10, 2));

        pool.rebalance().await;

        assert!(pool.runtime.updates().is_empty());
        assert_eq!(pool.runtime.removed(), vec![id.clone()]);
        let snap = pool.snapshot().await;
        assert!(snap.resources.is_empty());
        assert!(snap.reusable.is_empty());
        assert!(snap.running.is_empty());
    }

    #[tokio::test]
    async fn busy_cpu_keeps_an_otherwise_idle_sandbox() {
        let pool = pool();
        let id = pool.acquire("py").await.expect("acquire");
        // Memory idle, CPU well above its idle threshold.
        pool.runtime.set_stats(&id, stats(10, 50));

        pool.rebalance().await;

        let snap = pool.snapshot().await;
        assert!(snap.resources.contains_key(&id));
        assert!(pool.runtime.removed().is_empty());
    }

    #[tokio::test]
    async fn stats_failure_reaps_the_sandbox() {
        let pool = pool();
        let id = pool.acquire("py").await.expect("acquire");
        pool.runtime.fail_stats(&id);

        pool.rebalance().await;

        assert_eq!(pool.runtime.removed(), vec![id]);
        assert!(pool.snapshot().await.resources.is_empty());
    }

    #[tokio::test]
    async fn update_failure_reaps_the_sandbox() {
        let pool = pool();
        let id = pool.acquire("py").await.expect("acquire");
        pool.runtime.set_stats(&id, stats(95, 50));
        pool.runtime.fail_update(&id);

        pool.rebalance().await;

        assert_eq!(pool.runtime.removed(), vec![id]);
        assert!(pool.snapshot().await.resources.is_empty());
    }

    #[tokio::test]
    async fn release_after_reap_is_tolerated() {
        let pool = pool();
        let id = pool.acquire("py").await.expect("acquire");
        pool.runtime.set_stats(&id, stats(10, 2));
        pool.rebalance().await;

        // The session still holds the id; its release must be a no-op.
        pool.release(&id).await;

        let snap = pool.snapshot().await;
        assert!(snap.resources.is_empty());
        assert_eq!(pool.runtime.removed().len(), 1);
    }
}
