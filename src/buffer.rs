//! Pending-chunk queue with an exact cached aggregate size.

use std::collections::VecDeque;

use bytes::BytesMut;

use crate::chunk::Chunk;

/// FIFO queue of chunks awaiting a consumer.
///
/// The aggregate size is maintained on every mutation rather than computed
/// from the items: byte length for byte chunks, string length for text
/// chunks, one per item in object mode.
pub(crate) struct ChunkQueue {
    items: VecDeque<Chunk>,
    size: usize,
    object_mode: bool,
}

impl ChunkQueue {
    pub fn new(object_mode: bool) -> Self {
        Self {
            items: VecDeque::new(),
            size: 0,
            object_mode,
        }
    }

    fn metric(&self, chunk: &Chunk) -> usize {
        if self.object_mode {
            return 1;
        }
        match chunk {
            Chunk::Bytes(b) => b.len(),
            Chunk::Text(s) => s.len(),
            Chunk::Object(_) => 1,
        }
    }

    pub fn push(&mut self, chunk: Chunk) {
        self.size += self.metric(&chunk);
        self.items.push_back(chunk);
    }

    pub fn shift(&mut self) -> Option<Chunk> {
        let chunk = self.items.pop_front()?;
        self.size -= self.metric(&chunk);
        Some(chunk)
    }

    /// Aggregate size of everything queued.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.size = 0;
    }

    /// Collapse all queued items into a single chunk. Only meaningful for
    /// byte and text queues; object queues are left alone.
    pub fn coalesce(&mut self) {
        if self.object_mode || self.items.len() < 2 {
            return;
        }
        match self.items.front() {
            Some(Chunk::Text(_)) => {
                let mut joined = String::with_capacity(self.size);
                for item in self.items.drain(..) {
                    if let Chunk::Text(s) = item {
                        joined.push_str(&s);
                    }
                }
                self.items.push_back(Chunk::Text(joined));
            }
            Some(Chunk::Bytes(_)) => {
                let mut joined = BytesMut::with_capacity(self.size);
                for item in self.items.drain(..) {
                    if let Chunk::Bytes(b) = item {
                        joined.extend_from_slice(&b);
                    }
                }
                self.items.push_back(Chunk::Bytes(joined.freeze()));
            }
            _ => {}
        }
    }

    /// Remove the head item, or a prefix of it when `n` is given.
    ///
    /// A text split that would land inside a codepoint widens to the next
    /// char boundary, and the cached size drops by the actual amount
    /// removed, so the size stays exact.
    pub fn take(&mut self, n: Option<usize>) -> Option<Chunk> {
        let Some(n) = n else { return self.shift() };
        let head = self.items.front_mut()?;
        match head {
            Chunk::Bytes(b) => {
                if n >= b.len() {
                    self.shift()
                } else {
                    let prefix = b.split_to(n);
                    self.size -= n;
                    Some(Chunk::Bytes(prefix))
                }
            }
            Chunk::Text(s) => {
                let mut cut = n;
                while cut < s.len() && !s.is_char_boundary(cut) {
                    cut += 1;
                }
                if cut >= s.len() {
                    self.shift()
                } else {
                    let rest = s.split_off(cut);
                    let prefix = std::mem::replace(s, rest);
                    self.size -= cut;
                    Some(Chunk::Text(prefix))
                }
            }
            Chunk::Object(_) => self.shift(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn test_size_tracks_mutations() {
        let mut q = ChunkQueue::new(false);
        q.push(Chunk::from(&b"abc"[..]));
        q.push(Chunk::from(&b"de"[..]));
        assert_eq!(q.size(), 5);
        assert_eq!(q.item_count(), 2);

        q.shift();
        assert_eq!(q.size(), 2);

        q.clear();
        assert_eq!(q.size(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_object_mode_counts_items() {
        let mut q = ChunkQueue::new(true);
        q.push(Chunk::Object(json!({"i": 1})));
        q.push(Chunk::from("also one"));
        assert_eq!(q.size(), 2);
        q.shift();
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn test_coalesce_bytes() {
        let mut q = ChunkQueue::new(false);
        q.push(Chunk::from(&b"hello"[..]));
        q.push(Chunk::from(&b" "[..]));
        q.push(Chunk::from(&b"world"[..]));
        q.coalesce();
        assert_eq!(q.item_count(), 1);
        assert_eq!(q.size(), 11);
        assert_eq!(
            q.shift().unwrap().into_bytes().unwrap(),
            Bytes::from_static(b"hello world")
        );
    }

    #[test]
    fn test_coalesce_text() {
        let mut q = ChunkQueue::new(false);
        q.push(Chunk::from("foo"));
        q.push(Chunk::from("bar"));
        q.coalesce();
        assert_eq!(q.item_count(), 1);
        assert_eq!(q.shift().unwrap().as_text().unwrap(), "foobar");
    }

    #[test]
    fn test_take_split_bytes() {
        let mut q = ChunkQueue::new(false);
        q.push(Chunk::from(&b"hello"[..]));
        let prefix = q.take(Some(2)).unwrap();
        assert_eq!(prefix.as_bytes().unwrap().as_ref(), b"he");
        assert_eq!(q.size(), 3);
        let rest = q.take(None).unwrap();
        assert_eq!(rest.as_bytes().unwrap().as_ref(), b"llo");
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn test_take_widens_to_char_boundary() {
        let mut q = ChunkQueue::new(false);
        q.push(Chunk::from("a\u{2603}b"));
        // "a" is 1 byte, the snowman 3; a cut at 2 lands mid-codepoint and
        // widens to 4.
        let prefix = q.take(Some(2)).unwrap();
        assert_eq!(prefix.as_text().unwrap(), "a\u{2603}");
        assert_eq!(q.size(), 1);
        assert_eq!(q.shift().unwrap().as_text().unwrap(), "b");
    }

    #[test]
    fn test_take_whole_when_n_covers_head() {
        let mut q = ChunkQueue::new(false);
        q.push(Chunk::from(&b"ab"[..]));
        let whole = q.take(Some(2)).unwrap();
        assert_eq!(whole.as_bytes().unwrap().as_ref(), b"ab");
        assert!(q.is_empty());
    }
}
