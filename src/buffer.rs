//! Ordered buffer of pending row inserts, drained in homogeneous packs.
//!
//! A batching sink pushes every converted row here and flushes whole
//! packs — maximal prefixes sharing `(table, columns)` — so each flush
//! maps onto a single multi-row insert on the sink side.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct InsertItem {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl InsertItem {
    fn same_shape(&self, other: &InsertItem) -> bool {
        self.table == other.table && self.columns == other.columns
    }
}

pub struct InsertBuffer {
    threshold: usize,
    items: Mutex<VecDeque<InsertItem>>,
}

impl InsertBuffer {
    pub const DEFAULT_THRESHOLD: usize = 1_000;

    pub fn new(threshold: usize) -> InsertBuffer {
        InsertBuffer {
            threshold,
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends one item, preserving arrival order. Returns true when the
    /// buffer has grown past its threshold and should be flushed.
    pub fn push(&self, table: impl Into<String>, columns: Vec<String>, values: Vec<Value>) -> bool {
        let mut items = self.items.lock().expect("insert buffer poisoned");
        items.push_back(InsertItem {
            table: table.into(),
            columns,
            values,
        });
        items.len() > self.threshold
    }

    /// Removes and returns the maximal leading run of items that share
    /// `(table, columns)`. Empty when the buffer is empty. Items are never
    /// reordered, deduplicated, or split below what is available.
    pub fn drain_pack(&self) -> Vec<InsertItem> {
        let mut items = self.items.lock().expect("insert buffer poisoned");
        let first = match items.front() {
            Some(first) => first.clone(),
            None => return Vec::new(),
        };
        let mut pack = Vec::new();
        while let Some(item) = items.front() {
            if !first.same_shape(item) {
                break;
            }
            pack.push(items.pop_front().expect("front observed above"));
        }
        pack
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("insert buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overloaded(&self) -> bool {
        self.len() > self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn empty_buffer_drains_nothing() {
        let buffer = InsertBuffer::new(10);
        assert!(buffer.drain_pack().is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn push_reports_overload_past_threshold() {
        let buffer = InsertBuffer::new(2);
        assert!(!buffer.push("t", cols(&["id"]), vec![json!(1)]));
        assert!(!buffer.push("t", cols(&["id"]), vec![json!(2)]));
        assert!(buffer.push("t", cols(&["id"]), vec![json!(3)]));
        assert!(buffer.overloaded());
    }

    #[test]
    fn drain_returns_maximal_homogeneous_prefix() {
        let buffer = InsertBuffer::new(100);
        buffer.push("items", cols(&["id", "v"]), vec![json!(1), json!(10)]);
        buffer.push("items", cols(&["id", "v"]), vec![json!(2), json!(20)]);
        buffer.push("items2", cols(&["id", "v"]), vec![json!(3), json!(30)]);
        buffer.push("items", cols(&["id", "v"]), vec![json!(4), json!(40)]);

        let pack = buffer.drain_pack();
        assert_eq!(pack.len(), 2);
        assert!(pack.iter().all(|i| i.table == "items"));
        assert_eq!(pack[0].values, vec![json!(1), json!(10)]);
        assert_eq!(pack[1].values, vec![json!(2), json!(20)]);

        // remainder is the exact suffix, still in order
        let pack = buffer.drain_pack();
        assert_eq!(pack.len(), 1);
        assert_eq!(pack[0].table, "items2");
        let pack = buffer.drain_pack();
        assert_eq!(pack.len(), 1);
        assert_eq!(pack[0].values, vec![json!(4), json!(40)]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn differing_columns_split_packs() {
        let buffer = InsertBuffer::new(100);
        buffer.push("items", cols(&["id", "v"]), vec![json!(1), json!(10)]);
        buffer.push("items", cols(&["id", "v", "deleted"]), vec![json!(2), json!(20), json!(1)]);
        assert_eq!(buffer.drain_pack().len(), 1);
        assert_eq!(buffer.drain_pack().len(), 1);
    }

    #[test]
    fn fifo_preserved_within_pack() {
        let buffer = InsertBuffer::new(100);
        for i in 0..50 {
            buffer.push("t", cols(&["id"]), vec![json!(i)]);
        }
        let pack = buffer.drain_pack();
        let got: Vec<i64> = pack.iter().map(|i| i.values[0].as_i64().unwrap()).collect();
        let want: Vec<i64> = (0..50).collect();
        assert_eq!(got, want);
    }
}
