//! Buffer page, the unit the WAL ring is made of

use bytes::Bytes;

/// A fixed-capacity byte region plus an overflow list.
///
/// Once anything lands in `overflow`, every later append to this page goes
/// there too until the page is drained, so the on-disk order is always the
/// fixed region followed by the overflow records in append order.
#[derive(Debug)]
pub struct BufferPage {
    content: Box<[u8]>,
    cursor: usize,
    overflow: Vec<Bytes>,
}

impl BufferPage {
    pub fn new(capacity: usize) -> Self {
        Self {
            content: vec![0u8; capacity].into_boxed_slice(),
            cursor: 0,
            overflow: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.content.len()
    }

    /// Bytes held in the fixed region
    pub fn used(&self) -> usize {
        self.cursor
    }

    pub fn has_overflow(&self) -> bool {
        !self.overflow.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0 && self.overflow.is_empty()
    }

    /// Total buffered bytes, fixed region plus overflow
    pub fn pending_len(&self) -> usize {
        self.cursor + self.overflow.iter().map(Bytes::len).sum::<usize>()
    }

    /// Try to buffer `record` in this page.
    ///
    /// Returns `false` when the page is full and the record belongs in the
    /// next page. Records larger than the whole page are accepted into the
    /// overflow list, as is anything appended after the overflow started.
    pub fn try_append(&mut self, record: &[u8]) -> bool {
        if self.has_overflow() || record.len() > self.capacity() {
            self.overflow.push(Bytes::copy_from_slice(record));
            return true;
        }
        if self.cursor + record.len() > self.capacity() {
            return false;
        }
        self.content[self.cursor..self.cursor + record.len()].copy_from_slice(record);
        self.cursor += record.len();
        true
    }

    /// Take everything buffered, in write order, and reset the page
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut chunks = Vec::with_capacity(1 + self.overflow.len());
        if self.cursor > 0 {
            chunks.push(Bytes::copy_from_slice(&self.content[..self.cursor]));
        }
        chunks.append(&mut self.overflow);
        self.cursor = 0;
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flatten(chunks: Vec<Bytes>) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }

    #[test]
    fn test_fixed_region_fills_then_refuses() {
        let mut page = BufferPage::new(8);
        assert!(page.try_append(b"abcd"));
        assert!(page.try_append(b"efg"));
        assert!(!page.try_append(b"hi"));
        assert_eq!(page.used(), 7);
        assert_eq!(flatten(page.drain()), b"abcdefg");
        assert!(page.is_empty());
    }

    #[test]
    fn test_oversized_record_goes_to_overflow_and_sticks() {
        let mut page = BufferPage::new(4);
        assert!(page.try_append(b"ab"));
        assert!(page.try_append(b"0123456789"));
        assert!(page.has_overflow());
        // Fits in the fixed region, but overflow already started.
        assert!(page.try_append(b"c"));
        assert_eq!(page.used(), 2);
        assert_eq!(page.pending_len(), 13);
        assert_eq!(flatten(page.drain()), b"ab0123456789c");
        assert!(!page.has_overflow());
        assert!(page.try_append(b"wxyz"));
    }
}
