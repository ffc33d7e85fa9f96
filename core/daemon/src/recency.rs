//! Deduplicated, recency-ordered list of command lines.
//!
//! Removal leaves a tombstone in the slot vector instead of shifting the
//! tail, and the vector is compacted once tombstones outnumber live entries,
//! so `touch` stays O(1) amortized. Order is least recent first.

use histd_protocol::HistlistView;
use std::collections::HashMap;

const MIN_COMPACT_SLOTS: usize = 64;

#[derive(Debug, Default)]
pub struct RecencyIndex {
    slots: Vec<Option<String>>,
    positions: HashMap<String, usize>,
}

impl RecencyIndex {
    pub fn with_capacity(size_hint: usize) -> Self {
        Self {
            slots: Vec::with_capacity(size_hint),
            positions: HashMap::with_capacity(size_hint),
        }
    }

    /// Moves `cmd_line` to the most recent position, inserting it if new.
    pub fn touch(&mut self, cmd_line: &str) {
        if let Some(position) = self.positions.get(cmd_line).copied() {
            if position + 1 == self.slots.len() {
                return;
            }
            self.slots[position] = None;
        }
        self.slots.push(Some(cmd_line.to_string()));
        self.positions
            .insert(cmd_line.to_string(), self.slots.len() - 1);

        if self.slots.len() >= MIN_COMPACT_SLOTS && self.slots.len() > 2 * self.positions.len() {
            self.compact();
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Independent copy with dense positions.
    pub fn snapshot(&self) -> HistlistView {
        let list: Vec<String> = self.slots.iter().flatten().cloned().collect();
        let last_index = list
            .iter()
            .enumerate()
            .map(|(index, cmd_line)| (cmd_line.clone(), index))
            .collect();
        HistlistView { list, last_index }
    }

    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(cmd_line) = slot {
                if let Some(position) = self.positions.get_mut(cmd_line) {
                    *position = index;
                }
            }
        }
    }
}
