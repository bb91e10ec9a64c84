//! Fixed-depth ring of bounded tick buffers.
//!
//! Level 0 is the buffer currently being filled. [`HistoricalBufferManager::start_new_buffer`]
//! snapshots it and rotates the ring, so the level `d` hops behind current is
//! what was current `d` rotations ago. Misuse (zero depth or capacity, a
//! depth outside the ring) panics.

use std::collections::VecDeque;

use serde::Serialize;

/// Default number of levels.
pub const DEFAULT_HISTORY_DEPTH: usize = 1;
/// Default capacity of each level.
pub const DEFAULT_CAPACITY: usize = 100;

/// Snapshot of one level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BufferedData<T> {
    /// Items in push order.
    pub buffer: Vec<T>,
    /// Items evicted because the level was full.
    pub overflow: u64,
}

#[derive(Debug)]
struct BufferLevel<T> {
    items: VecDeque<T>,
    capacity: usize,
    overflow: u64,
}

impl<T: Clone> BufferLevel<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            overflow: 0,
        }
    }

    fn snapshot(&self) -> BufferedData<T> {
        BufferedData {
            buffer: self.items.iter().cloned().collect(),
            overflow: self.overflow,
        }
    }

    fn reset(&mut self, capacity: usize) {
        self.items.clear();
        self.capacity = capacity;
        self.overflow = 0;
    }
}

/// Ring of `history_depth` bounded buffers.
#[derive(Debug)]
pub struct HistoricalBufferManager<T> {
    levels: Vec<BufferLevel<T>>,
    current: usize,
    default_capacity: usize,
}

impl<T: Clone> HistoricalBufferManager<T> {
    /// Create a ring of `history_depth` levels holding `capacity` items each.
    ///
    /// # Panics
    ///
    /// If either argument is zero.
    pub fn new(history_depth: usize, capacity: usize) -> Self {
        assert!(history_depth >= 1, "invalid history depth {history_depth}");
        assert!(capacity >= 1, "invalid buffer capacity {capacity}");
        Self {
            levels: (0..history_depth).map(|_| BufferLevel::new(capacity)).collect(),
            current: 0,
            default_capacity: capacity,
        }
    }

    /// Number of levels.
    pub fn history_depth(&self) -> usize {
        self.levels.len()
    }

    /// Append to the current level, evicting its oldest item when full.
    pub fn push_value(&mut self, item: T) {
        let level = &mut self.levels[self.current];
        if level.items.len() >= level.capacity {
            let _ = level.items.pop_front();
            level.overflow += 1;
        }
        level.items.push_back(item);
    }

    /// Snapshot the current level, rotate, and reset the new current level
    /// with the default capacity.
    pub fn start_new_buffer(&mut self) -> BufferedData<T> {
        self.start_new_buffer_with_capacity(self.default_capacity)
    }

    /// Like [`start_new_buffer`](Self::start_new_buffer) with an explicit
    /// capacity for the new current level.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn start_new_buffer_with_capacity(&mut self, capacity: usize) -> BufferedData<T> {
        assert!(capacity >= 1, "invalid buffer capacity {capacity}");
        let snapshot = self.levels[self.current].snapshot();
        self.current = self.index(self.levels.len() - 1);
        self.levels[self.current].reset(capacity);
        snapshot
    }

    /// Read the level `depth` rotations behind current.
    ///
    /// # Panics
    ///
    /// If `depth >= history_depth`.
    pub fn get_buffer(&self, depth: usize) -> BufferedData<T> {
        self.level(depth).snapshot()
    }

    /// Whether the level `depth` rotations behind current holds no items.
    ///
    /// # Panics
    ///
    /// If `depth >= history_depth`.
    pub fn is_empty(&self, depth: usize) -> bool {
        self.level(depth).items.is_empty()
    }

    fn level(&self, depth: usize) -> &BufferLevel<T> {
        assert!(
            depth < self.levels.len(),
            "depth {depth} beyond max history {}",
            self.levels.len()
        );
        &self.levels[self.index(depth)]
    }

    fn index(&self, depth: usize) -> usize {
        (self.current + depth) % self.levels.len()
    }
}

impl<T: Clone> Default for HistoricalBufferManager<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_DEPTH, DEFAULT_CAPACITY)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
