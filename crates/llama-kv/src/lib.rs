//! # llama-kv
//!
//! KV cache contract and reference implementation for llama.rs sessions.
//!
//! Supports:
//! - **Append**: Writes K/V for one or more tokens at the current offset
//! - **Trim end**: Drops the newest positions (undo speculative / rejected tokens)
//! - **Trim front**: Evicts the oldest positions (sliding-window context)
//! - **Multi-layer**: [`SessionKVCache`] applies every operation to all layers
//!
//! Engines are free to bring their own per-layer storage; anything that
//! implements [`KvCache`] can back a session.

use std::sync::Arc;

use parking_lot::Mutex;

/// Error type for KV cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache capacity exceeded: {seq_len} > {max}")]
    CapacityExceeded { seq_len: usize, max: usize },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
}

pub type KVResult<T> = Result<T, KVError>;

/// One transformer layer's cache, as seen by a session.
///
/// `offset` is the number of cached positions. Both trims clamp `n` to the
/// current offset and return how many positions were actually removed.
pub trait KvCache: Send {
    /// Number of cached positions.
    fn offset(&self) -> usize;

    /// Write K/V for one or more new positions at the current offset.
    fn append(&mut self, k_seq: &[f32], v_seq: &[f32]) -> KVResult<()>;

    /// Remove the newest `n` positions.
    fn trim_end(&mut self, n: usize) -> usize;

    /// Evict the oldest `n` positions.
    fn trim_front(&mut self, n: usize) -> usize;
}

/// Single transformer layer's K and V cache, stored as flat `f32` buffers.
///
/// Shape per position is `[n_heads, head_dim]`.
///
/// # Invariants
/// - `seq_len <= capacity`
/// - K and V always hold the same number of positions
#[derive(Debug, Clone)]
pub struct LayerKVCache {
    /// K tensor, flattened `[capacity, n_heads, head_dim]`.
    pub k: Vec<f32>,
    /// V tensor, flattened `[capacity, n_heads, head_dim]`.
    pub v: Vec<f32>,
    /// Maximum number of positions this layer can hold.
    pub capacity: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    /// Number of positions currently cached.
    pub seq_len: usize,
}

impl LayerKVCache {
    /// Create an empty cache for one transformer layer.
    pub fn new(capacity: usize, n_heads: usize, head_dim: usize) -> Self {
        let buf_len = capacity * n_heads * head_dim;
        Self {
            k: vec![0.0; buf_len],
            v: vec![0.0; buf_len],
            capacity,
            n_heads,
            head_dim,
            seq_len: 0,
        }
    }

    fn token_size(&self) -> usize {
        self.n_heads * self.head_dim
    }

    /// Append K/V for `k_seq.len() / (n_heads * head_dim)` positions.
    ///
    /// # Errors
    /// - `ShapeMismatch`: buffers are not a whole number of positions, or K and V differ
    /// - `CapacityExceeded`: the write would pass `capacity`; nothing is written
    pub fn append(&mut self, k_seq: &[f32], v_seq: &[f32]) -> KVResult<()> {
        let token_size = self.token_size();
        if token_size == 0 || k_seq.len() % token_size != 0 || k_seq.len() != v_seq.len() {
            let got = if k_seq.len() != v_seq.len() {
                v_seq.len()
            } else {
                k_seq.len()
            };
            return Err(KVError::ShapeMismatch {
                expected: token_size,
                got,
            });
        }

        let new_tokens = k_seq.len() / token_size;
        if self.seq_len + new_tokens > self.capacity {
            return Err(KVError::CapacityExceeded {
                seq_len: self.seq_len + new_tokens,
                max: self.capacity,
            });
        }

        let start = self.seq_len * token_size;
        self.k[start..start + k_seq.len()].copy_from_slice(k_seq);
        self.v[start..start + v_seq.len()].copy_from_slice(v_seq);
        self.seq_len += new_tokens;
        Ok(())
    }

    /// K/V of one cached position.
    pub fn position(&self, pos: usize) -> Option<(&[f32], &[f32])> {
        if pos >= self.seq_len {
            return None;
        }
        let size = self.token_size();
        let range = pos * size..(pos + 1) * size;
        Some((&self.k[range.clone()], &self.v[range]))
    }

    /// Clear the cache (reset seq_len to 0).
    pub fn clear(&mut self) {
        self.seq_len = 0;
    }
}

impl KvCache for LayerKVCache {
    fn offset(&self) -> usize {
        self.seq_len
    }

    fn append(&mut self, k_seq: &[f32], v_seq: &[f32]) -> KVResult<()> {
        LayerKVCache::append(self, k_seq, v_seq)
    }

    fn trim_end(&mut self, n: usize) -> usize {
        let n = n.min(self.seq_len);
        self.seq_len -= n;
        n
    }

    fn trim_front(&mut self, n: usize) -> usize {
        let n = n.min(self.seq_len);
        if n == 0 {
            return 0;
        }
        let size = self.token_size();
        let live = self.seq_len * size;
        self.k.copy_within(n * size..live, 0);
        self.v.copy_within(n * size..live, 0);
        self.seq_len -= n;
        n
    }
}

/// Session-level cache: one [`KvCache`] per transformer layer.
///
/// Every operation is applied to all layers, so their offsets move together.
pub struct SessionKVCache {
    layers: Vec<Box<dyn KvCache>>,
}

/// A session cache shared between a session and the decode cursor writing into it.
pub type SharedCache = Arc<Mutex<SessionKVCache>>;

impl SessionKVCache {
    pub fn new(layers: Vec<Box<dyn KvCache>>) -> Self {
        Self { layers }
    }

    /// Wrap into a [`SharedCache`].
    pub fn shared(self) -> SharedCache {
        Arc::new(Mutex::new(self))
    }

    /// Cached positions, read from the first layer (0 for a layerless cache).
    pub fn offset(&self) -> usize {
        self.layers.first().map_or(0, |l| l.offset())
    }

    /// Whether every layer reports the same offset.
    pub fn is_synchronized(&self) -> bool {
        let offset = self.offset();
        self.layers.iter().all(|l| l.offset() == offset)
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Mutable access to the layers for the engine's forward pass.
    pub fn layers_mut(&mut self) -> &mut [Box<dyn KvCache>] {
        &mut self.layers
    }

    /// Trim the newest `n` positions from every layer. Returns the largest
    /// per-layer count actually trimmed.
    pub fn trim_end(&mut self, n: usize) -> usize {
        self.layers
            .iter_mut()
            .map(|l| l.trim_end(n))
            .max()
            .unwrap_or(0)
    }

    /// Evict the oldest `n` positions from every layer, clamped per layer.
    /// Returns the largest per-layer count actually evicted.
    pub fn trim_front(&mut self, n: usize) -> usize {
        self.layers
            .iter_mut()
            .map(|l| l.trim_front(n))
            .max()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for SessionKVCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKVCache")
            .field("n_layers", &self.layers.len())
            .field("offset", &self.offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, tokens: usize) -> LayerKVCache {
        let mut cache = LayerKVCache::new(capacity, 2, 2);
        for t in 0..tokens {
            let k = vec![t as f32; 4];
            let v = vec![-(t as f32); 4];
            cache.append(&k, &v).unwrap();
        }
        cache
    }

    #[test]
    fn layer_append_multiple_positions() {
        let mut cache = LayerKVCache::new(10, 2, 4);
        cache.append(&[0.1; 24], &[0.2; 24]).unwrap();
        assert_eq!(cache.offset(), 3);
    }

    #[test]
    fn layer_capacity_exceeded_writes_nothing() {
        let mut cache = filled(2, 2);
        let result = cache.append(&[0.0; 4], &[0.0; 4]);
        assert!(matches!(result, Err(KVError::CapacityExceeded { seq_len: 3, max: 2 })));
        assert_eq!(cache.offset(), 2);
    }

    #[test]
    fn layer_shape_mismatch() {
        let mut cache = LayerKVCache::new(10, 2, 4);
        let result = cache.append(&[0.1; 8], &[0.2; 7]);
        assert!(matches!(result, Err(KVError::ShapeMismatch { .. })));
        let result = cache.append(&[0.1; 7], &[0.2; 7]);
        assert!(matches!(result, Err(KVError::ShapeMismatch { .. })));
    }

    #[test]
    fn layer_trim_end_clamps() {
        let mut cache = filled(8, 3);
        assert_eq!(cache.trim_end(2), 2);
        assert_eq!(cache.offset(), 1);
        assert_eq!(cache.trim_end(5), 1);
        assert_eq!(cache.offset(), 0);
        assert_eq!(cache.trim_end(1), 0);
    }

    #[test]
    fn layer_trim_front_shifts_remaining_positions() {
        let mut cache = filled(8, 4);
        assert_eq!(cache.trim_front(2), 2);
        assert_eq!(cache.offset(), 2);
        // Former positions 2 and 3 are now 0 and 1.
        assert_eq!(cache.position(0).unwrap().0, &[2.0; 4]);
        assert_eq!(cache.position(1).unwrap().1, &[-3.0; 4]);
        assert!(cache.position(2).is_none());
    }

    #[test]
    fn layer_trim_front_clamps() {
        let mut cache = filled(8, 2);
        assert_eq!(cache.trim_front(10), 2);
        assert_eq!(cache.offset(), 0);
        assert_eq!(cache.trim_front(1), 0);
    }

    #[test]
    fn append_after_trim_reuses_slots() {
        let mut cache = filled(3, 3);
        cache.trim_end(1);
        cache.append(&[9.0; 4], &[9.0; 4]).unwrap();
        assert_eq!(cache.offset(), 3);
        assert_eq!(cache.position(2).unwrap().0, &[9.0; 4]);
    }

    #[test]
    fn session_trims_all_layers() {
        let layers: Vec<Box<dyn KvCache>> = (0..3)
            .map(|_| Box::new(filled(8, 5)) as Box<dyn KvCache>)
            .collect();
        let mut session = SessionKVCache::new(layers);
        assert_eq!(session.n_layers(), 3);
        assert_eq!(session.offset(), 5);

        assert_eq!(session.trim_end(2), 2);
        assert_eq!(session.offset(), 3);
        assert_eq!(session.trim_front(1), 1);
        assert_eq!(session.offset(), 2);
        assert!(session.is_synchronized());
    }

    #[test]
    fn session_trim_front_clamps_per_layer() {
        let layers: Vec<Box<dyn KvCache>> =
            vec![Box::new(filled(8, 2)), Box::new(filled(8, 4))];
        let mut session = SessionKVCache::new(layers);
        assert!(!session.is_synchronized());
        assert_eq!(session.trim_front(3), 3);
        assert_eq!(session.offset(), 0);
        assert_eq!(session.layers_mut()[1].offset(), 1);
    }

    #[test]
    fn append_through_trait_object() {
        let layers: Vec<Box<dyn KvCache>> = vec![Box::new(LayerKVCache::new(4, 1, 2))];
        let mut session = SessionKVCache::new(layers);
        session.layers_mut()[0].append(&[1.0, 2.0], &[3.0, 4.0]).unwrap();
        assert_eq!(session.offset(), 1);
    }

    #[test]
    fn empty_session_is_noop() {
        let mut session = SessionKVCache::new(Vec::new());
        assert_eq!(session.offset(), 0);
        assert_eq!(session.trim_end(4), 0);
        assert_eq!(session.trim_front(4), 0);
    }
}
