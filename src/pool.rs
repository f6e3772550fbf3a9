//! Typed, per-stream reusable-buffer pool.
//!
//! Each stream kind owns a LIFO free list and a set of outstanding buffer
//! ids. The pool pre-allocates `initial_size` buffers per kind and may grow
//! by `expand_size` on a miss, bounded by the global `max_pool_size`. A
//! [`BufferLease`] is the exclusively-owned token for a buffer; dropping the
//! lease returns the buffer to the pool, so every frame path releases its
//! buffer no matter how it exits. The explicit [`BufferPool::release`] keeps
//! the untracked-buffer check for detached buffers.
//!
//! All operations are synchronous, in-memory and serialized behind one lock;
//! the pool is the only mutable state shared across sensors.

use crate::error::PoolError;
use crate::stream::{BufferSpec, StreamKind};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Sizing policy for the pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Buffers pre-allocated per kind at construction and after `clear`.
    pub initial_size: usize,
    /// Buffers allocated per growth step, for the requesting kind alone.
    pub expand_size: usize,
    /// Global cap on buffers across all kinds.
    pub max_pool_size: usize,
    /// Zero-fill buffers when they return to the free list.
    pub zero_on_release: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 2,
            expand_size: 2,
            max_pool_size: 32,
            zero_on_release: false,
        }
    }
}

impl From<&crate::config::BufferPoolSettings> for PoolConfig {
    fn from(settings: &crate::config::BufferPoolSettings) -> Self {
        Self {
            initial_size: settings.initial_size,
            expand_size: settings.expand_size,
            max_pool_size: settings.max_pool_size,
            zero_on_release: settings.zero_on_release,
        }
    }
}

/// Observable pool events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PoolEvent {
    #[serde(rename_all = "camelCase")]
    Exhausted {
        kind: StreamKind,
        total: usize,
        in_use: usize,
    },
    #[serde(rename_all = "camelCase")]
    Released {
        kind: StreamKind,
        available: usize,
        in_use: usize,
    },
    #[serde(rename_all = "camelCase")]
    Resized { max: usize, total: usize },
}

/// A fixed-size byte region owned by the pool.
///
/// Equality is by identity: two buffers compare equal only if they are the
/// same pool allocation.
#[derive(Debug)]
pub struct Buffer {
    id: u64,
    kind: StreamKind,
    data: Vec<u8>,
    len: usize,
}

impl Buffer {
    fn new(id: u64, spec: &BufferSpec) -> Self {
        Self {
            id,
            kind: spec.kind,
            data: vec![0u8; spec.byte_size()],
            len: 0,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Valid data written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the valid data length.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the buffer capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.data.len(),
            "set_len({}) exceeds buffer capacity ({})",
            len,
            self.data.len()
        );
        self.len = len;
    }

    /// Copy `src` into the buffer and set the valid length.
    ///
    /// # Panics
    ///
    /// Panics if the slice is longer than the buffer capacity.
    pub fn copy_from_slice(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.data.len(),
            "copy_from_slice: len ({}) exceeds buffer capacity ({})",
            src.len(),
            self.data.len()
        );
        self.data[..src.len()].copy_from_slice(src);
        self.len = src.len();
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Buffer {}

struct KindPool {
    spec: BufferSpec,
    /// LIFO free list: the most recently released buffer is reused first.
    free: Vec<Buffer>,
    outstanding: HashSet<u64>,
}

impl KindPool {
    fn total(&self) -> usize {
        self.free.len() + self.outstanding.len()
    }
}

struct PoolState {
    initial_size: usize,
    expand_size: usize,
    max_pool_size: usize,
    zero_on_release: bool,
    next_id: u64,
    kinds: HashMap<StreamKind, KindPool>,
}

impl PoolState {
    fn total_all(&self) -> usize {
        self.kinds.values().map(KindPool::total).sum()
    }

    fn in_use_all(&self) -> usize {
        self.kinds.values().map(|k| k.outstanding.len()).sum()
    }

    fn allocate(&mut self, kind: StreamKind) -> Buffer {
        let pool = self.kinds.get_mut(&kind).expect("kind registered");
        let id = self.next_id;
        self.next_id += 1;
        Buffer::new(id, &pool.spec)
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    events: broadcast::Sender<PoolEvent>,
    hits: AtomicU64,
    misses: AtomicU64,
    created: AtomicU64,
    released: AtomicU64,
    peak_in_use: AtomicUsize,
}

/// Pool of reusable frame buffers, one sub-pool per stream kind.
///
/// Cloning the handle is cheap; all clones share the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool serving the given kinds, pre-allocating
    /// `initial_size` buffers for each.
    pub fn new(config: PoolConfig, kinds: &[StreamKind]) -> Self {
        let (events, _) = broadcast::channel(64);

        let mut state = PoolState {
            initial_size: config.initial_size,
            expand_size: config.expand_size,
            max_pool_size: config.max_pool_size,
            zero_on_release: config.zero_on_release,
            next_id: 0,
            kinds: HashMap::new(),
        };
        for &kind in kinds {
            state.kinds.insert(
                kind,
                KindPool {
                    spec: kind.buffer_spec(),
                    free: Vec::new(),
                    outstanding: HashSet::new(),
                },
            );
        }

        let mut created = 0u64;
        for &kind in kinds {
            for _ in 0..config.initial_size {
                let buffer = state.allocate(kind);
                state
                    .kinds
                    .get_mut(&kind)
                    .expect("kind registered")
                    .free
                    .push(buffer);
                created += 1;
            }
        }

        let total_bytes: usize = state
            .kinds
            .values()
            .map(|k| k.total() * k.spec.byte_size())
            .sum();
        info!(
            kinds = kinds.len(),
            initial_per_kind = config.initial_size,
            max_pool_size = config.max_pool_size,
            preallocated_mb = total_bytes as f64 / (1024.0 * 1024.0),
            "buffer pool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(state),
                events,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                created: AtomicU64::new(created),
                released: AtomicU64::new(0),
                peak_in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Acquire a buffer of the given kind.
    ///
    /// Pops from the free list on a hit. On a miss the pool grows by up to
    /// `expand_size` buffers for this kind, subject to the global cap; when
    /// no headroom remains the call fails with [`PoolError::Exhausted`] and
    /// emits a matching event, and the caller must drop the frame.
    pub fn acquire(&self, kind: StreamKind) -> Result<BufferLease, PoolError> {
        let mut state = self.inner.state.lock().expect("pool lock");

        let buffer = {
            let pool = state.kinds.get_mut(&kind).ok_or(PoolError::Exhausted {
                kind,
                total: 0,
                in_use: 0,
            })?;
            pool.free.pop()
        };

        let buffer = match buffer {
            Some(buffer) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                let headroom = state.max_pool_size.saturating_sub(state.total_all());
                let grow = state.expand_size.min(headroom);
                if grow == 0 {
                    let total = state.total_all();
                    let in_use = state.in_use_all();
                    drop(state);
                    warn!(%kind, total, in_use, "buffer pool exhausted");
                    let _ = self.inner.events.send(PoolEvent::Exhausted {
                        kind,
                        total,
                        in_use,
                    });
                    return Err(PoolError::Exhausted {
                        kind,
                        total,
                        in_use,
                    });
                }
                for _ in 0..grow {
                    let extra = state.allocate(kind);
                    state
                        .kinds
                        .get_mut(&kind)
                        .expect("kind registered")
                        .free
                        .push(extra);
                }
                self.inner.created.fetch_add(grow as u64, Ordering::Relaxed);
                state
                    .kinds
                    .get_mut(&kind)
                    .expect("kind registered")
                    .free
                    .pop()
                    .expect("buffer just allocated")
            }
        };

        let pool = state.kinds.get_mut(&kind).expect("kind registered");
        pool.outstanding.insert(buffer.id);

        let in_use = state.in_use_all();
        self.inner.peak_in_use.fetch_max(in_use, Ordering::Relaxed);

        Ok(BufferLease {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Return a detached buffer to the pool.
    ///
    /// The buffer must be in the outstanding set for its kind; otherwise the
    /// call fails with [`PoolError::UntrackedBuffer`] and the pool state is
    /// unchanged.
    pub fn release(&self, buffer: Buffer) -> Result<(), PoolError> {
        release_inner(&self.inner, buffer)
    }

    /// Change the global buffer cap.
    ///
    /// Rejected when the new cap is below the current outstanding count.
    /// Free-list buffers above the new cap are discarded.
    pub fn resize(&self, new_max: usize) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock().expect("pool lock");
        let in_use = state.in_use_all();
        if new_max < in_use {
            return Err(PoolError::ShrinkBelowInUse {
                requested: new_max,
                in_use,
            });
        }
        state.max_pool_size = new_max;
        while state.total_all() > new_max {
            let kind = state
                .kinds
                .iter()
                .filter(|(_, p)| !p.free.is_empty())
                .max_by_key(|(_, p)| p.free.len())
                .map(|(k, _)| *k)
                .expect("free buffer available while over cap");
            state
                .kinds
                .get_mut(&kind)
                .expect("kind registered")
                .free
                .pop();
        }
        let total = state.total_all();
        drop(state);
        info!(max = new_max, total, "buffer pool resized");
        let _ = self.inner.events.send(PoolEvent::Resized {
            max: new_max,
            total,
        });
        Ok(())
    }

    /// Drop every buffer and re-initialize to `initial_size` per kind.
    ///
    /// Rejected while any buffer is outstanding.
    pub fn clear(&self) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock().expect("pool lock");
        let outstanding = state.in_use_all();
        if outstanding > 0 {
            return Err(PoolError::ClearWhileInUse { outstanding });
        }
        let kinds: Vec<StreamKind> = state.kinds.keys().copied().collect();
        for kind in &kinds {
            state.kinds.get_mut(kind).expect("kind registered").free.clear();
        }
        let initial = state.initial_size;
        let mut created = 0u64;
        for kind in kinds {
            for _ in 0..initial {
                let buffer = state.allocate(kind);
                state
                    .kinds
                    .get_mut(&kind)
                    .expect("kind registered")
                    .free
                    .push(buffer);
                created += 1;
            }
        }
        self.inner.created.fetch_add(created, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().expect("pool lock");
        let mut kinds: Vec<KindPoolStats> = state
            .kinds
            .iter()
            .map(|(kind, pool)| KindPoolStats {
                kind: *kind,
                available: pool.free.len(),
                in_use: pool.outstanding.len(),
                total: pool.total(),
                buffer_bytes: pool.spec.byte_size(),
                total_bytes: pool.total() * pool.spec.byte_size(),
            })
            .collect();
        kinds.sort_by_key(|k| k.kind);
        let total = state.total_all();
        let total_bytes = kinds.iter().map(|k| k.total_bytes).sum();
        PoolStats {
            kinds,
            total,
            max_pool_size: state.max_pool_size,
            total_bytes,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            created: self.inner.created.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            peak_in_use: self.inner.peak_in_use.load(Ordering::Relaxed),
        }
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }
}

fn release_inner(inner: &PoolInner, mut buffer: Buffer) -> Result<(), PoolError> {
    let mut state = inner.state.lock().expect("pool lock");
    let kind = buffer.kind;
    let tracked = state
        .kinds
        .get_mut(&kind)
        .map(|pool| pool.outstanding.remove(&buffer.id))
        .unwrap_or(false);
    if !tracked {
        return Err(PoolError::UntrackedBuffer { kind });
    }

    inner.released.fetch_add(1, Ordering::Relaxed);

    // A resize may have lowered the cap while this buffer was out; discard
    // instead of returning above the cap.
    if state.total_all() + 1 > state.max_pool_size {
        let (available, in_use) = {
            let pool = &state.kinds[&kind];
            (pool.free.len(), pool.outstanding.len())
        };
        drop(state);
        let _ = inner.events.send(PoolEvent::Released {
            kind,
            available,
            in_use,
        });
        return Ok(());
    }

    if state.zero_on_release {
        buffer.data.fill(0);
    }
    buffer.len = 0;
    let pool = state.kinds.get_mut(&kind).expect("kind registered");
    pool.free.push(buffer);
    let available = pool.free.len();
    let in_use = pool.outstanding.len();
    drop(state);
    let _ = inner.events.send(PoolEvent::Released {
        kind,
        available,
        in_use,
    });
    Ok(())
}

/// Exclusively-owned token for a pooled buffer.
///
/// Dropping the lease returns the buffer to the pool.
pub struct BufferLease {
    buffer: Option<Buffer>,
    pool: Arc<PoolInner>,
}

impl BufferLease {
    pub fn kind(&self) -> StreamKind {
        self.buffer.as_ref().expect("lease holds buffer").kind
    }

    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, Buffer::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_ref().expect("lease holds buffer").as_slice()
    }

    pub fn copy_from_slice(&mut self, src: &[u8]) {
        self.buffer
            .as_mut()
            .expect("lease holds buffer")
            .copy_from_slice(src);
    }

    /// Take the buffer out of the lease without releasing it.
    ///
    /// The caller becomes responsible for handing the buffer back through
    /// [`BufferPool::release`].
    pub fn detach(mut self) -> Buffer {
        self.buffer.take().expect("lease holds buffer")
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let kind = buffer.kind;
            if let Err(err) = release_inner(&self.pool, buffer) {
                warn!(%kind, %err, "buffer lease dropped outside pool tracking");
            }
        }
    }
}

impl std::fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("kind", &self.buffer.as_ref().map(|b| b.kind))
            .field("len", &self.len())
            .finish()
    }
}

/// Per-kind counters in a [`PoolStats`] snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindPoolStats {
    pub kind: StreamKind,
    pub available: usize,
    pub in_use: usize,
    pub total: usize,
    pub buffer_bytes: usize,
    pub total_bytes: usize,
}

/// Snapshot of pool counters, updated on every acquire and release.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub kinds: Vec<KindPoolStats>,
    pub total: usize,
    pub max_pool_size: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub created: u64,
    pub released: u64,
    pub peak_in_use: usize,
}

impl PoolStats {
    pub fn kind(&self, kind: StreamKind) -> Option<&KindPoolStats> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(initial: usize, expand: usize, max: usize) -> BufferPool {
        BufferPool::new(
            PoolConfig {
                initial_size: initial,
                expand_size: expand,
                max_pool_size: max,
                zero_on_release: true,
            },
            &[StreamKind::Depth, StreamKind::Infrared],
        )
    }

    fn depth_stats(pool: &BufferPool) -> KindPoolStats {
        pool.stats().kind(StreamKind::Depth).unwrap().clone()
    }

    #[test]
    fn test_preallocation() {
        let pool = small_pool(2, 2, 16);
        let stats = pool.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.created, 4);
        assert_eq!(stats.kind(StreamKind::Depth).unwrap().available, 2);
    }

    #[test]
    fn test_in_use_plus_available_is_total() {
        let pool = small_pool(2, 2, 16);
        let lease = pool.acquire(StreamKind::Depth).unwrap();
        let s = depth_stats(&pool);
        assert_eq!(s.in_use + s.available, s.total);
        assert_eq!(s.in_use, 1);
        drop(lease);
        let s = depth_stats(&pool);
        assert_eq!(s.in_use + s.available, s.total);
        assert_eq!(s.in_use, 0);
    }

    #[test]
    fn test_growth_and_exhaustion() {
        let pool = small_pool(1, 1, 3);
        let mut events = pool.subscribe();

        let a = pool.acquire(StreamKind::Depth).unwrap();
        let b = pool.acquire(StreamKind::Depth).unwrap();
        // The infrared initial buffer counts toward the global cap of 3, so
        // the depth pool cannot grow any further.
        let err = pool.acquire(StreamKind::Depth).unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert!(matches!(
            events.try_recv().unwrap(),
            PoolEvent::Exhausted { .. }
        ));
        assert!(events.try_recv().is_err());

        drop((a, b));
        assert!(pool.acquire(StreamKind::Depth).is_ok());
    }

    #[test]
    fn test_hit_miss_counters() {
        let pool = small_pool(1, 1, 8);
        let a = pool.acquire(StreamKind::Depth).unwrap();
        assert_eq!(pool.stats().hits, 1);
        let b = pool.acquire(StreamKind::Depth).unwrap();
        assert_eq!(pool.stats().misses, 1);
        drop((a, b));
        assert_eq!(pool.stats().released, 2);
    }

    #[test]
    fn test_detach_and_release() {
        let pool = small_pool(1, 1, 8);
        let lease = pool.acquire(StreamKind::Depth).unwrap();
        let buffer = lease.detach();
        assert_eq!(depth_stats(&pool).in_use, 1);
        pool.release(buffer).unwrap();
        let s = depth_stats(&pool);
        assert_eq!(s.in_use, 0);
        assert_eq!(s.available, 1);
    }

    #[test]
    fn test_untracked_release_leaves_state_unchanged() {
        let pool = small_pool(1, 1, 8);
        let other = small_pool(1, 1, 8);
        let foreign = other.acquire(StreamKind::Depth).unwrap().detach();

        let before = pool.stats();
        let err = pool.release(foreign).unwrap_err();
        assert!(matches!(err, PoolError::UntrackedBuffer { kind: StreamKind::Depth }));
        let after = pool.stats();
        assert_eq!(before.total, after.total);
        assert_eq!(before.released, after.released);
        assert_eq!(
            before.kind(StreamKind::Depth).unwrap().available,
            after.kind(StreamKind::Depth).unwrap().available
        );
    }

    #[test]
    fn test_release_event_fields() {
        let pool = small_pool(2, 1, 8);
        let mut events = pool.subscribe();
        let lease = pool.acquire(StreamKind::Depth).unwrap();
        drop(lease);
        match events.try_recv().unwrap() {
            PoolEvent::Released {
                kind,
                available,
                in_use,
            } => {
                assert_eq!(kind, StreamKind::Depth);
                assert_eq!(available, 2);
                assert_eq!(in_use, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_resize_rejects_below_in_use() {
        let pool = small_pool(2, 2, 16);
        let _a = pool.acquire(StreamKind::Depth).unwrap();
        let _b = pool.acquire(StreamKind::Infrared).unwrap();
        let err = pool.resize(1).unwrap_err();
        assert!(matches!(
            err,
            PoolError::ShrinkBelowInUse {
                requested: 1,
                in_use: 2
            }
        ));
        assert_eq!(pool.stats().max_pool_size, 16);
    }

    #[test]
    fn test_resize_discards_free_buffers_above_cap() {
        let pool = small_pool(2, 2, 16);
        assert_eq!(pool.stats().total, 4);
        pool.resize(2).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.max_pool_size, 2);
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn test_clear_rejects_while_outstanding() {
        let pool = small_pool(2, 2, 16);
        let lease = pool.acquire(StreamKind::Depth).unwrap();
        assert!(matches!(
            pool.clear().unwrap_err(),
            PoolError::ClearWhileInUse { outstanding: 1 }
        ));
        drop(lease);
        pool.clear().unwrap();
        assert_eq!(pool.stats().total, 4);
    }

    #[test]
    fn test_lease_copy_roundtrip() {
        let pool = small_pool(1, 1, 8);
        let mut lease = pool.acquire(StreamKind::Depth).unwrap();
        lease.copy_from_slice(&[1, 2, 3]);
        assert_eq!(lease.as_slice(), &[1, 2, 3]);
        assert_eq!(lease.len(), 3);
    }

    #[test]
    fn test_zero_on_release() {
        let pool = small_pool(1, 1, 8);
        let mut lease = pool.acquire(StreamKind::Depth).unwrap();
        lease.copy_from_slice(&[0xff; 16]);
        drop(lease);
        let lease = pool.acquire(StreamKind::Depth).unwrap();
        assert!(lease.is_empty());
    }
}
