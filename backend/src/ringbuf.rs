// =============================================================================
// VISS GATEWAY — Curve-logging ring buffer
// =============================================================================
// `head` is the next write slot, `tail` the oldest valid slot, so at most
// `capacity - 1` elements are populated. Owned by a single worker.
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RingElem { pub value: String, pub ts: String }

#[derive(Debug)]
pub struct RingBuffer { elems: Vec<RingElem>, head: usize, tail: usize }

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { elems: vec![RingElem::default(); capacity.max(2)], head: 0, tail: 0 }
    }

    pub fn capacity(&self) -> usize { self.elems.len() }

    pub fn populated(&self) -> usize {
        let cap = self.capacity();
        (self.head + cap - self.tail) % cap
    }

    /// Overwrites the oldest element when full.
    pub fn write(&mut self, value: &str, ts: &str) {
        let cap = self.capacity();
        let slot = &mut self.elems[self.head];
        slot.value.clear(); slot.value.push_str(value);
        slot.ts.clear(); slot.ts.push_str(ts);
        self.head = (self.head + 1) % cap;
        if self.head == self.tail { self.tail = (self.tail + 1) % cap; }
    }

    /// Offset 0 is the most recently written element.
    pub fn read(&self, offset: usize) -> Option<&RingElem> {
        if offset >= self.populated() { return None; }
        let cap = self.capacity();
        Some(&self.elems[(self.head + cap - 1 - offset) % cap])
    }

    pub fn latest_ts(&self) -> Option<&str> { self.read(0).map(|e| e.ts.as_str()) }

    /// Moves the tail so only the `keep` newest elements stay populated.
    pub fn retain_newest(&mut self, keep: usize) {
        let keep = keep.min(self.populated());
        let cap = self.capacity();
        self.tail = (self.head + cap - keep) % cap;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_populated_count_tracks_writes() {
        let mut rb = RingBuffer::new(6);
        for i in 0..5 {
            rb.write(&i.to_string(), &format!("t{i}"));
            assert_eq!(rb.populated(), i + 1);
            assert_eq!(rb.read(0).unwrap().value, i.to_string());
        }
        assert_eq!(rb.read(4).unwrap().value, "0");
        assert!(rb.read(5).is_none());
    }

    #[test]
    fn test_wraparound_drops_oldest() {
        let mut rb = RingBuffer::new(4);
        for i in 0..10 { rb.write(&i.to_string(), &format!("t{i}")); }
        assert_eq!(rb.populated(), 3);
        assert_eq!(rb.read(0).unwrap().value, "9");
        assert_eq!(rb.read(2).unwrap().value, "7");
    }

    #[test]
    fn test_retain_newest() {
        let mut rb = RingBuffer::new(8);
        for i in 0..7 { rb.write(&i.to_string(), &format!("t{i}")); }
        rb.retain_newest(2);
        assert_eq!(rb.populated(), 2);
        assert_eq!(rb.read(1).unwrap().value, "5");
        rb.write("7", "t7");
        assert_eq!(rb.populated(), 3);
        assert_eq!(rb.latest_ts(), Some("t7"));
    }
}
