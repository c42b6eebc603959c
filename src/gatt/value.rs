//! Attribute value buffers.
//!
//! [`CharacteristicValue`] keeps the externally visible value apart from the
//! bytes of an in-progress prepared write, and tracks the cursor used to
//! serve long values over several read requests.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::{Error, Result};

/// Value of a characteristic.
#[derive(Debug, Clone)]
pub struct CharacteristicValue {
    committed: Bytes,
    accumulation: BytesMut,
    // Bytes received for the current prepared write, including discarded ones.
    prepared_len: usize,
    read_offset: usize,
    accumulating: bool,
    max_len: usize,
}

impl CharacteristicValue {
    /// Create an empty value limited to `max_len` bytes.
    pub fn new(max_len: usize) -> Self {
        Self {
            committed: Bytes::new(),
            accumulation: BytesMut::new(),
            prepared_len: 0,
            read_offset: 0,
            accumulating: false,
            max_len,
        }
    }

    /// The committed value.
    pub fn value(&self) -> Bytes {
        self.committed.clone()
    }

    /// Length of the committed value.
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    /// Check if the committed value is empty.
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Maximum accepted length.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Replace the committed value directly, bypassing any accumulation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueTooLong`] and leaves the value unchanged if
    /// `data` exceeds the maximum length.
    pub fn set_value(&mut self, data: &[u8]) -> Result<()> {
        self.check_len(data.len())?;
        self.committed = Bytes::copy_from_slice(data);
        Ok(())
    }

    /// Append one part of a prepared write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueTooLong`] once the parts exceed the maximum
    /// length. The buffered bytes are dropped and every later part is
    /// rejected until the write is executed or cancelled, so executing it
    /// fails as well.
    pub fn add_part(&mut self, data: &[u8]) -> Result<()> {
        trace!(len = data.len(), total = self.prepared_len, "add part");
        self.accumulating = true;
        self.prepared_len = self.prepared_len.saturating_add(data.len());

        if let Err(e) = self.check_len(self.prepared_len) {
            self.accumulation.clear();
            return Err(e);
        }
        self.accumulation.extend_from_slice(data);
        Ok(())
    }

    /// Publish the accumulated parts as the committed value.
    ///
    /// An empty accumulation leaves the committed value untouched. Either way
    /// the accumulation and the read cursor are cleared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueTooLong`] if the accumulated parts exceed the
    /// maximum length; the parts are discarded.
    pub fn commit(&mut self) -> Result<()> {
        let parts = self.accumulation.split().freeze();
        let prepared_len = std::mem::take(&mut self.prepared_len);
        self.accumulating = false;
        self.read_offset = 0;

        self.check_len(prepared_len)?;
        if parts.is_empty() {
            return Ok(());
        }
        self.committed = parts;
        Ok(())
    }

    /// Discard the accumulated parts.
    pub fn cancel(&mut self) {
        self.accumulation.clear();
        self.prepared_len = 0;
        self.accumulating = false;
        self.read_offset = 0;
    }

    /// Whether a prepared write is in progress and may be executed.
    pub fn exec_allowed(&self) -> bool {
        self.accumulating
    }

    /// Current read cursor.
    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    /// Produce the bytes for the next read response.
    ///
    /// A fresh read (`is_long == false`) starts at the beginning: a value of
    /// at least `chunk_len` bytes yields exactly one chunk and leaves the
    /// cursor behind it, which makes the peer ask for a continuation. A
    /// continuation resumes at the cursor and clears it once the final,
    /// shorter chunk is produced.
    ///
    /// Returns the offset of the chunk within the value and the chunk.
    pub fn next_read_chunk(&mut self, is_long: bool, chunk_len: usize) -> (usize, Bytes) {
        let chunk_len = chunk_len.max(1);
        let len = self.committed.len();

        if !is_long {
            self.read_offset = 0;
            if len < chunk_len {
                return (0, self.committed.clone());
            }
            self.read_offset = chunk_len;
            return (0, self.committed.slice(..chunk_len));
        }

        let start = self.read_offset.min(len);
        let remaining = len.saturating_sub(start);
        if remaining < chunk_len {
            self.read_offset = 0;
            (start, self.committed.slice(start..))
        } else {
            self.read_offset = start + chunk_len;
            (start, self.committed.slice(start..start + chunk_len))
        }
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.max_len {
            return Err(Error::ValueTooLong {
                len,
                max: self.max_len,
            });
        }
        Ok(())
    }
}

/// Fixed-capacity value of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeValue {
    data: Bytes,
    capacity: usize,
}

impl AttributeValue {
    /// Create an empty value holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Bytes::new(),
            capacity,
        }
    }

    /// The current value.
    pub fn value(&self) -> Bytes {
        self.data.clone()
    }

    /// Current length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum length.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueTooLong`] and keeps the old capacity if the
    /// current value does not fit.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        if self.data.len() > capacity {
            return Err(Error::ValueTooLong {
                len: self.data.len(),
                max: capacity,
            });
        }
        self.capacity = capacity;
        Ok(())
    }

    /// Replace the value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueTooLong`] and leaves the value unchanged if
    /// `data` exceeds the capacity.
    pub fn set_value(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity {
            return Err(Error::ValueTooLong {
                len: data.len(),
                max: self.capacity,
            });
        }
        self.data = Bytes::copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_set_value_limit() {
        let mut value = CharacteristicValue::new(4);
        value.set_value(b"ABCD").unwrap();

        let err = value.set_value(b"ABCDE").unwrap_err();
        assert_eq!(err, Error::ValueTooLong { len: 5, max: 4 });
        assert_eq!(value.value(), Bytes::from_static(b"ABCD"));
    }

    #[test]
    fn test_accumulate_and_commit() {
        let mut value = CharacteristicValue::new(600);
        value.set_value(b"old").unwrap();
        assert!(!value.exec_allowed());

        value.add_part(b"hello ").unwrap();
        assert!(value.exec_allowed());
        value.add_part(b"world").unwrap();
        assert_eq!(value.value(), Bytes::from_static(b"old"));

        value.commit().unwrap();
        assert!(!value.exec_allowed());
        assert_eq!(value.value(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn test_cancel_keeps_committed() {
        let mut value = CharacteristicValue::new(600);
        value.set_value(b"keep").unwrap();
        value.add_part(b"discard").unwrap();
        value.cancel();

        assert!(!value.exec_allowed());
        assert_eq!(value.value(), Bytes::from_static(b"keep"));

        // A later commit has nothing left to publish.
        value.commit().unwrap();
        assert_eq!(value.value(), Bytes::from_static(b"keep"));
    }

    #[test]
    fn test_oversize_part_fails_prepared_write() {
        let mut value = CharacteristicValue::new(4);
        value.set_value(b"ok").unwrap();
        value.add_part(b"abc").unwrap();

        let err = value.add_part(b"def").unwrap_err();
        assert_eq!(err, Error::ValueTooLong { len: 6, max: 4 });
        assert!(value.accumulation.is_empty());
        assert!(value.exec_allowed());

        assert_eq!(value.commit(), Err(Error::ValueTooLong { len: 6, max: 4 }));
        assert!(!value.exec_allowed());
        assert_eq!(value.value(), Bytes::from_static(b"ok"));

        // A fresh prepared write starts from zero.
        value.add_part(b"new").unwrap();
        value.commit().unwrap();
        assert_eq!(value.value(), Bytes::from_static(b"new"));
    }

    #[test]
    fn test_prepared_parts_never_outgrow_limit() {
        let mut value = CharacteristicValue::new(600);
        let part = [0xAAu8; 22];

        let accepted = (0..1000)
            .map(|_| value.add_part(&part))
            .filter(|result| result.is_ok())
            .count();

        assert_eq!(accepted, 600 / 22);
        assert!(value.accumulation.len() <= 600);
        assert_eq!(
            value.commit(),
            Err(Error::ValueTooLong { len: 22_000, max: 600 })
        );
        assert!(value.is_empty());
    }

    #[test]
    fn test_read_chunks_50_bytes() {
        let mut value = CharacteristicValue::new(600);
        value.set_value(&[7u8; 50]).unwrap();

        let (off, first) = value.next_read_chunk(false, 22);
        assert_eq!((off, first.len()), (0, 22));
        assert_eq!(value.read_offset(), 22);

        let (off, second) = value.next_read_chunk(true, 22);
        assert_eq!((off, second.len()), (22, 22));
        assert_eq!(value.read_offset(), 44);

        let (off, third) = value.next_read_chunk(true, 22);
        assert_eq!((off, third.len()), (44, 6));
        assert_eq!(value.read_offset(), 0);
    }

    #[test]
    fn test_short_read_is_single_response() {
        let mut value = CharacteristicValue::new(600);
        value.set_value(b"ABC").unwrap();

        let (off, chunk) = value.next_read_chunk(false, 22);
        assert_eq!(off, 0);
        assert_eq!(chunk, Bytes::from_static(b"ABC"));
        assert_eq!(value.read_offset(), 0);
    }

    #[test]
    fn test_exact_chunk_ends_with_empty_continuation() {
        let mut value = CharacteristicValue::new(600);
        value.set_value(&[1u8; 22]).unwrap();

        assert_eq!(value.next_read_chunk(false, 22).1.len(), 22);
        let (off, last) = value.next_read_chunk(true, 22);
        assert_eq!(off, 22);
        assert!(last.is_empty());
        assert_eq!(value.read_offset(), 0);
    }

    #[test]
    fn test_attribute_value_capacity() {
        let mut value = AttributeValue::new(2);
        value.set_value(&[0x01, 0x00]).unwrap();
        assert!(value.set_value(&[1, 2, 3]).is_err());
        assert_eq!(value.value(), Bytes::from_static(&[0x01, 0x00]));

        assert!(value.set_capacity(1).is_err());
        value.set_capacity(3).unwrap();
        value.set_value(&[1, 2, 3]).unwrap();
        assert_eq!(value.capacity(), 3);
    }

    proptest! {
        #[test]
        fn prop_chunks_reassemble(data in proptest::collection::vec(any::<u8>(), 0..600),
                                  chunk_len in 1usize..64) {
            let mut value = CharacteristicValue::new(600);
            value.set_value(&data).unwrap();

            let mut out = Vec::new();
            let (_, first) = value.next_read_chunk(false, chunk_len);
            out.extend_from_slice(&first);
            let mut more = first.len() == chunk_len;
            while more {
                let (off, chunk) = value.next_read_chunk(true, chunk_len);
                prop_assert_eq!(off, out.len());
                out.extend_from_slice(&chunk);
                more = chunk.len() == chunk_len;
            }

            prop_assert_eq!(out, data);
            prop_assert_eq!(value.read_offset(), 0);
        }

        #[test]
        fn prop_set_value_respects_limit(data in proptest::collection::vec(any::<u8>(), 0..700)) {
            let mut value = CharacteristicValue::new(600);
            value.set_value(b"before").unwrap();
            let accepted = value.set_value(&data).is_ok();

            prop_assert_eq!(accepted, data.len() <= 600);
            if accepted {
                let stored = value.value();
                prop_assert_eq!(&stored[..], &data[..]);
            } else {
                let stored = value.value();
                prop_assert_eq!(&stored[..], &b"before"[..]);
            }
        }
    }
}
