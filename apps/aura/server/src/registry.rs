//! Connection registry: two independent pools mapping registry-issued tags
//! to live connection handles.
//!
//! Each pool is guarded by its own mutex. Nothing in this module sends on a
//! handle; callers take a handle or a [`Registry::snapshot`] and release the
//! lock before doing any I/O.

use std::{collections::HashMap, fmt};

use aura_core::Action;
use metrics::gauge;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use slab::Slab;

use crate::connection::ConnectionHandle;

/// Opaque correlation identifier issued at accept time.
pub type Tag = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Clients,
    Providers,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Clients => "clients",
            PoolKind::Providers => "providers",
        }
    }

    /// Action used when announcing this pool's size.
    pub fn stat_action(&self) -> Action {
        match self {
            PoolKind::Clients => Action::Clients,
            PoolKind::Providers => Action::Providers,
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSizes {
    pub clients: usize,
    pub providers: usize,
}

pub struct Registry {
    clients: Pool,
    providers: Pool,
    // Always locked after a pool lock, never before.
    rng: Mutex<StdRng>,
}

struct Pool {
    kind: PoolKind,
    inner: Mutex<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    slab: Slab<PoolEntry>,
    index: HashMap<Tag, usize>,
}

struct PoolEntry {
    tag: Tag,
    handle: ConnectionHandle,
}

impl Registry {
    /// Builds a registry whose random source is seeded from `seed`, or from
    /// OS entropy when no seed is given.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(rng)
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            clients: Pool::new(PoolKind::Clients),
            providers: Pool::new(PoolKind::Providers),
            rng: Mutex::new(rng),
        }
    }

    fn pool(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::Clients => &self.clients,
            PoolKind::Providers => &self.providers,
        }
    }

    /// Stores `handle` under a tag not currently live in `kind` and returns it.
    pub fn register(&self, kind: PoolKind, handle: ConnectionHandle) -> Tag {
        let pool = self.pool(kind);
        let mut guard = pool.inner.lock();
        let tag = {
            let mut rng = self.rng.lock();
            loop {
                let candidate = fresh_tag(&mut rng);
                if !guard.index.contains_key(&candidate) {
                    break candidate;
                }
            }
        };
        let slot = guard.slab.insert(PoolEntry {
            tag: tag.clone(),
            handle,
        });
        guard.index.insert(tag.clone(), slot);
        pool.record_size(guard.slab.len());
        tag
    }

    /// Removes `tag` from `kind`, returning the handle if it was still live.
    /// Removing an absent tag is a no-op.
    pub fn unregister(&self, kind: PoolKind, tag: &str) -> Option<ConnectionHandle> {
        let pool = self.pool(kind);
        let mut guard = pool.inner.lock();
        let slot = guard.index.remove(tag)?;
        let entry = guard.slab.remove(slot);
        pool.record_size(guard.slab.len());
        Some(entry.handle)
    }

    pub fn lookup(&self, kind: PoolKind, tag: &str) -> Option<ConnectionHandle> {
        let guard = self.pool(kind).inner.lock();
        guard
            .index
            .get(tag)
            .and_then(|slot| guard.slab.get(*slot))
            .map(|entry| entry.handle.clone())
    }

    /// Picks a uniformly random live member of `kind`.
    pub fn random_member(&self, kind: PoolKind) -> Option<(Tag, ConnectionHandle)> {
        let guard = self.pool(kind).inner.lock();
        let len = guard.slab.len();
        if len == 0 {
            return None;
        }
        let pick = self.rng.lock().gen_range(0..len);
        guard
            .slab
            .iter()
            .nth(pick)
            .map(|(_, entry)| (entry.tag.clone(), entry.handle.clone()))
    }

    /// Point-in-time copy of `kind`, ordered by slot.
    pub fn snapshot(&self, kind: PoolKind) -> Vec<(Tag, ConnectionHandle)> {
        let guard = self.pool(kind).inner.lock();
        guard
            .slab
            .iter()
            .map(|(_, entry)| (entry.tag.clone(), entry.handle.clone()))
            .collect()
    }

    pub fn size(&self, kind: PoolKind) -> usize {
        self.pool(kind).inner.lock().slab.len()
    }

    pub fn sizes(&self) -> PoolSizes {
        PoolSizes {
            clients: self.size(PoolKind::Clients),
            providers: self.size(PoolKind::Providers),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Pool {
    fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn record_size(&self, len: usize) {
        gauge!("aura_pool_members", len as f64, "pool" => self.kind.as_str());
    }
}

fn fresh_tag(rng: &mut StdRng) -> Tag {
    let bytes: [u8; 16] = rng.gen();
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string()
}
