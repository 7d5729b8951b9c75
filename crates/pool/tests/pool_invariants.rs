//! Structural invariants of the packing tables under arbitrary
//! acquire/release interleavings.

use std::collections::HashSet;
use std::sync::Arc;

use pool::{Catalog, HostPaths, Pool, PoolConfig, PoolSnapshot};
use runtime::testing::InMemoryRuntime;

const LANGS: &[&str] = &["py", "js", "cpp"];

fn pool() -> (Arc<InMemoryRuntime>, Pool<InMemoryRuntime>) {
    let rt = Arc::new(InMemoryRuntime::new());
    let catalog = Catalog::builtin(&HostPaths::new("/tmp/pool-invariants".into()));
    let pool = Pool::new(
        Arc::clone(&rt),
        Arc::new(catalog),
        PoolConfig::default(),
    );
    (rt, pool)
}

/// Deterministic pseudo-random sequence (numerical-recipes LCG).
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

/// Assert every structural invariant against a snapshot.
///
/// * a sandbox id appears in at most one of the two tables;
/// * reusable counts are in `[1, K-1]`, full counts at least `K`;
/// * the union of both tables is exactly the resource table;
/// * total seats equal the outstanding acquire/release balance.
fn assert_invariants(snap: &PoolSnapshot, max_users: usize, outstanding: usize) {
    let mut seen = HashSet::new();

    for (lang, table) in &snap.reusable {
        for (id, users) in table {
            assert!(seen.insert(id.clone()), "{id} appears twice");
            assert!(
                (1..max_users).contains(users),
                "reusable {lang}/{id} holds {users} users"
            );
        }
    }
    for (lang, table) in &snap.full {
        for (id, users) in table {
            assert!(seen.insert(id.clone()), "{id} in both tables");
            assert!(*users >= max_users, "full {lang}/{id} holds {users} users");
        }
    }

    let tracked: HashSet<_> = snap.resources.keys().cloned().collect();
    assert_eq!(seen, tracked, "packing tables disagree with resource table");

    let running_total: usize = snap.running.values().sum();
    assert_eq!(running_total, tracked.len(), "running counts drifted");

    assert_eq!(snap.total_users(), outstanding, "seat conservation broken");
}

#[tokio::test]
async fn invariants_hold_across_random_interleavings() {
    let (_rt, pool) = pool();
    let mut rng = Lcg(0x5eed);
    let mut held: Vec<String> = Vec::new();

    for step in 0..400 {
        let acquire = held.is_empty() || rng.next() % 3 != 0;
        if acquire {
            let lang = LANGS[(rng.next() as usize) % LANGS.len()];
            let id = pool.acquire(lang).await.expect("acquire");
            held.push(id);
        } else {
            let idx = (rng.next() as usize) % held.len();
            let id = held.swap_remove(idx);
            pool.release(&id).await;
        }

        let snap = pool.snapshot().await;
        assert_invariants(&snap, pool.config().max_users, held.len());

        // Releases of already-returned seats must stay no-ops.
        if step % 50 == 0 {
            pool.release("sbx-0000").await;
            let snap = pool.snapshot().await;
            assert_invariants(&snap, pool.config().max_users, held.len());
        }
    }

    // Wind down completely; the pool must end empty.
    for id in held.drain(..) {
        pool.release(&id).await;
    }
    let snap = pool.snapshot().await;
    assert_invariants(&snap, pool.config().max_users, 0);
    assert!(snap.resources.is_empty());
}

#[tokio::test]
async fn reaping_mid_sequence_keeps_tables_consistent() {
    let (rt, pool) = pool();
    let mut held = Vec::new();
    for _ in 0..6 {
        held.push(pool.acquire("py").await.expect("acquire"));
    }

    // Reap every sandbox via the controller path: scripted stats below both
    // idle thresholds.
    for id in rt.live_sandboxes() {
        rt.set_stats(
            &id,
            runtime::SandboxStats {
                memory_usage: 5,
                memory_limit: 100,
                cpu_delta: 1,
                system_delta: 100,
                online_cpus: 1,
            },
        );
    }
    pool.rebalance().await;

    let snap = pool.snapshot().await;
    assert!(snap.resources.is_empty());

    // All held seats now point at reaped sandboxes; releases are no-ops.
    for id in held {
        pool.release(&id).await;
    }
    let snap = pool.snapshot().await;
    assert_eq!(snap.total_users(), 0);
    assert!(snap.running.is_empty());
}
