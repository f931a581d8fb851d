//! Fixed-capacity circular storage with a logical oldest-to-newest view.
//!
//! Slots are written in place at a cursor that wraps around, so pushing a new
//! entry never shifts the existing ones. Reads reorder the slots into temporal
//! order.

/// Ring of `capacity` slots holding the most recent pushes.
#[derive(Debug, Clone)]
pub struct CircularBuffer<T: Clone> {
    slots: Vec<T>,
    cursor: usize,
    fill: T,
}

impl<T: Clone> CircularBuffer<T> {
    /// Create a ring whose slots all start as `fill`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, fill: T) -> Self {
        assert!(capacity > 0, "circular buffer needs at least one slot");
        Self {
            slots: vec![fill.clone(); capacity],
            cursor: 0,
            fill,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Next slot to be written, which is also the oldest entry.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Overwrite every slot with the fill value and rewind the cursor.
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = self.fill.clone();
        }
        self.cursor = 0;
    }

    /// Write `value` at the cursor and advance it.
    pub fn push(&mut self, value: T) {
        self.slots[self.cursor] = value;
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    /// Iterate the slots from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (newer, older) = self.slots.split_at(self.cursor);
        older.iter().chain(newer.iter())
    }

    /// Slots in temporal order.
    pub fn window(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// Most recently pushed value.
    pub fn latest(&self) -> &T {
        let len = self.slots.len();
        &self.slots[(self.cursor + len - 1) % len]
    }
}
