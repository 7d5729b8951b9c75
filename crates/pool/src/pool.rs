//! Sandbox registry and packing scheduler.
//!
//! Up to `max_users` sessions share one sandbox. Per language the pool
//! keeps two tables: `reusable` (sandboxes with a free seat) and `full`
//! (at capacity, excluded from the acquire search). A sandbox id lives in
//! exactly one of the two; the `resources` table tracks every sandbox's
//! language and current quota.
//!
//! All mutations go through one async mutex, held only for map work —
//! never across a runtime RPC. Provisioning reserves under the lock, calls
//! the runtime unlocked, then commits the new sandbox or rolls the
//! reservation back.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use runtime::ContainerRuntime;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};

/// Language and current quota of one tracked sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxEntry {
    pub lang: String,
    /// Current memory limit in bytes.
    pub memory: i64,
    /// Current CPU allowance in runtime CPU units.
    pub cpu: i64,
}

/// Per-language user-count tables. `BTreeMap` keeps iteration in id order,
/// which makes the least-loaded tie-break deterministic (smallest id wins).
type SeatTable = HashMap<String, BTreeMap<String, usize>>;

#[derive(Default)]
pub(crate) struct PoolState {
    pub(crate) reusable: SeatTable,
    pub(crate) full: SeatTable,
    pub(crate) running: HashMap<String, usize>,
    pub(crate) resources: HashMap<String, SandboxEntry>,
}

/// Point-in-time copy of the pool tables.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub reusable: SeatTable,
    pub full: SeatTable,
    pub running: HashMap<String, usize>,
    pub resources: HashMap<String, SandboxEntry>,
}

impl PoolSnapshot {
    /// Total seats currently handed out.
    pub fn total_users(&self) -> usize {
        self.reusable
            .values()
            .chain(self.full.values())
            .flat_map(|table| table.values())
            .sum()
    }
}

pub struct Pool<R> {
    pub(crate) runtime: Arc<R>,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) config: PoolConfig,
    pub(crate) state: Mutex<PoolState>,
}

impl<R: ContainerRuntime> Pool<R> {
    pub fn new(runtime: Arc<R>, catalog: Arc<Catalog>, config: PoolConfig) -> Self {
        Self {
            runtime,
            catalog,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Claim one seat for `lang`, reusing the least-loaded sandbox with a
    /// free seat or provisioning a fresh one.
    pub async fn acquire(&self, lang: &str) -> Result<String> {
        let spec = self.catalog.get(lang)?;

        {
            let mut state = self.state.lock().await;

            let best = state.reusable.get(lang).and_then(|table| {
                table
                    .iter()
                    .min_by_key(|(id, users)| (**users, (*id).clone()))
                    .map(|(id, users)| (id.clone(), *users))
            });

            // A count at or above capacity in `reusable` is a stale
            // overflow entry; fall through and provision instead.
            if let Some((id, users)) = best {
                if users < self.config.max_users {
                    let next = users + 1;
                    if next >= self.config.max_users {
                        remove_seat(&mut state.reusable, lang, &id);
                        state
                            .full
                            .entry(lang.to_string())
                            .or_default()
                            .insert(id.clone(), next);
                    } else {
                        state
                            .reusable
                            .entry(lang.to_string())
                            .or_default()
                            .insert(id.clone(), next);
                    }
                    debug!(sandbox_id = %id, lang, users = next, "reusing sandbox");
                    return Ok(id);
                }
            }

            // Reserve the slot so the running count covers the sandbox
            // while the creation RPC runs outside the lock.
            *state.running.entry(lang.to_string()).or_insert(0) += 1;
        }

        match self.runtime.create_sandbox(&spec.sandbox_spec()).await {
            Ok(id) => {
                let mut state = self.state.lock().await;
                state
                    .reusable
                    .entry(lang.to_string())
                    .or_default()
                    .insert(id.clone(), 1);
                state.resources.insert(
                    id.clone(),
                    SandboxEntry {
                        lang: lang.to_string(),
                        memory: spec.min_mem,
                        cpu: spec.min_cpu,
                    },
                );
                info!(sandbox_id = %id, lang, "provisioned sandbox");
                Ok(id)
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                decrement_running(&mut state.running, lang);
                warn!(lang, error = %e, "sandbox provision failed");
                Err(PoolError::SandboxCreateFailed(e.to_string()))
            }
        }
    }

    /// Return one seat. The last seat of a reusable sandbox destroys it; a
    /// seat freed from a full sandbox moves it back to `reusable`. Unknown
    /// ids are ignored — the controller may have reaped the sandbox first.
    pub async fn release(&self, id: &str) {
        let evict = {
            let mut state = self.state.lock().await;
            let Some(lang) = state.resources.get(id).map(|entry| entry.lang.clone()) else {
                debug!(sandbox_id = %id, "release of untracked sandbox ignored");
                return;
            };

            if let Some(users) = seat_count(&state.reusable, &lang, id) {
                if users > 1 {
                    state
                        .reusable
                        .entry(lang.clone())
                        .or_default()
                        .insert(id.to_string(), users - 1);
                    debug!(sandbox_id = %id, lang, users = users - 1, "seat released");
                    false
                } else {
                    remove_seat(&mut state.reusable, &lang, id);
                    state.resources.remove(id);
                    decrement_running(&mut state.running, &lang);
                    info!(sandbox_id = %id, lang, "last seat released, destroying sandbox");
                    true
                }
            } else if let Some(users) = seat_count(&state.full, &lang, id) {
                let next = users - 1;
                if next < self.config.max_users {
                    remove_seat(&mut state.full, &lang, id);
                    if next == 0 {
                        state.resources.remove(id);
                        decrement_running(&mut state.running, &lang);
                        info!(sandbox_id = %id, lang, "last seat released, destroying sandbox");
                        true
                    } else {
                        state
                            .reusable
                            .entry(lang.clone())
                            .or_default()
                            .insert(id.to_string(), next);
                        debug!(sandbox_id = %id, lang, users = next, "sandbox back in rotation");
                        false
                    }
                } else {
                    state
                        .full
                        .entry(lang.clone())
                        .or_default()
                        .insert(id.to_string(), next);
                    false
                }
            } else {
                false
            }
        };

        if evict {
            self.destroy(id).await;
        }
    }

    /// Drop every tracked sandbox (shutdown path).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let mut state = self.state.lock().await;
            state.reusable.clear();
            state.full.clear();
            state.running.clear();
            state.resources.drain().map(|(id, _)| id).collect()
        };
        if !ids.is_empty() {
            info!(count = ids.len(), "destroying all sandboxes");
        }
        for id in ids {
            self.destroy(&id).await;
        }
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().await;
        PoolSnapshot {
            reusable: state.reusable.clone(),
            full: state.full.clone(),
            running: state.running.clone(),
            resources: state.resources.clone(),
        }
    }

    /// Forced removal at the runtime. Never fails the caller.
    pub(crate) async fn destroy(&self, id: &str) {
        if let Err(e) = self.runtime.remove_sandbox(id).await {
            warn!(sandbox_id = %id, error = %e, "sandbox removal failed");
        }
    }
}

fn seat_count(table: &SeatTable, lang: &str, id: &str) -> Option<usize> {
    table.get(lang).and_then(|seats| seats.get(id)).copied()
}

pub(crate) fn remove_seat(table: &mut SeatTable, lang: &str, id: &str) {
    if let Some(seats) = table.get_mut(lang) {
        seats.remove(id);
        if seats.is_empty() {
            table.remove(lang);
        }
    }
}

pub(crate) fn decrement_running(running: &mut HashMap<String, usize>, lang: &str) {
    if let Some(count) = running.get_mut(lang) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            running.remove(lang);
        }
    }
}
