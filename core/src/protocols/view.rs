//! Bounded read cursor over a packet buffer.
//!
//! A `View` tracks three anchors into the buffer: the current read position,
//! the last committed position, and the absolute extent. Each protocol layer
//! reads forward from the current position; a successful layer calls
//! [`commit`](View::commit), and a failed one calls
//! [`rollback`](View::rollback) to return to the last commit. Reads past the
//! committed end are reported as [`ViewError::Truncated`] rather than
//! panicking; truncation is an expected condition on capture-sliced packets.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ViewError {
    #[error("not enough bytes in view")]
    Truncated,
}

pub type Result<T> = std::result::Result<T, ViewError>;

/// Bounded cursor over a byte buffer with commit/rollback anchors.
#[derive(Debug, Clone)]
pub struct View<'a> {
    buf: &'a [u8],
    /// Current read window, as offsets into `buf`.
    begin: usize,
    end: usize,
    /// Last committed window.
    cp_begin: usize,
    cp_end: usize,
    /// Bytes on the wire, which may exceed the captured buffer.
    wire_len: usize,
}

impl<'a> View<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        View {
            buf,
            begin: 0,
            end: buf.len(),
            cp_begin: 0,
            cp_end: buf.len(),
            wire_len: buf.len(),
        }
    }

    /// Creates a view over a capture-truncated buffer with the original wire
    /// length recorded separately.
    pub fn with_wire_len(buf: &'a [u8], wire_len: usize) -> Self {
        let mut v = View::new(buf);
        v.wire_len = wire_len;
        v
    }

    /// Whether `n` more bytes can be read from the current position.
    #[inline]
    pub fn sufficient(&self, n: usize) -> bool {
        self.begin + n <= self.end
    }

    /// Remaining bytes in the current window.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end - self.begin
    }

    /// Remaining bytes in the committed window.
    #[inline]
    pub fn committed_remaining(&self) -> usize {
        self.cp_end - self.cp_begin
    }

    /// Bytes consumed since the last commit.
    #[inline]
    pub fn pending(&self) -> usize {
        self.committed_remaining() - self.remaining()
    }

    /// Total bytes in the underlying buffer.
    #[inline]
    pub fn absolute(&self) -> usize {
        self.buf.len()
    }

    /// Bytes consumed and committed so far.
    #[inline]
    pub fn committed(&self) -> usize {
        self.cp_begin
    }

    /// Original wire length of the packet.
    #[inline]
    pub fn wire_len(&self) -> usize {
        self.wire_len
    }

    /// Makes the current position the new rollback anchor.
    #[inline]
    pub fn commit(&mut self) {
        self.cp_begin = self.begin;
        self.cp_end = self.end;
    }

    /// Returns the cursor to the last committed position.
    #[inline]
    pub fn rollback(&mut self) {
        self.begin = self.cp_begin;
        self.end = self.cp_end;
    }

    /// Skips `n` bytes.
    pub fn discard(&mut self, n: usize) -> Result<()> {
        if !self.sufficient(n) {
            return Err(ViewError::Truncated);
        }
        self.begin += n;
        Ok(())
    }

    /// Shrinks the view by `n` bytes from the end.
    pub fn discard_end(&mut self, n: usize) -> Result<()> {
        if !self.sufficient(n) {
            return Err(ViewError::Truncated);
        }
        self.end -= n;
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        if !self.sufficient(1) {
            return Err(ViewError::Truncated);
        }
        let v = self.buf[self.begin];
        self.begin += 1;
        Ok(v)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(self.get_uint(2)? as u16)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(self.get_uint(4)? as u32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.get_uint(8)
    }

    /// Reads an `n`-byte big-endian unsigned integer, `n <= 8`. Used for
    /// fields that do not fall on power-of-two widths (MAC addresses).
    pub fn get_uint(&mut self, n: usize) -> Result<u64> {
        if !self.sufficient(n) {
            return Err(ViewError::Truncated);
        }
        let v = BigEndian::read_uint(&self.buf[self.begin..], n);
        self.begin += n;
        Ok(v)
    }

    /// Reads a 128-bit value (IPv6 address).
    pub fn get_u128(&mut self) -> Result<u128> {
        if !self.sufficient(16) {
            return Err(ViewError::Truncated);
        }
        let v = BigEndian::read_u128(&self.buf[self.begin..]);
        self.begin += 16;
        Ok(v)
    }

    /// Reads the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8> {
        if !self.sufficient(1) {
            return Err(ViewError::Truncated);
        }
        Ok(self.buf[self.begin])
    }

    /// Reads the trailing 32-bit word of the current window without
    /// consuming it (Ethernet frame check sequence).
    pub fn peek_end_u32(&self) -> Result<u32> {
        if !self.sufficient(4) {
            return Err(ViewError::Truncated);
        }
        Ok(BigEndian::read_u32(&self.buf[self.end - 4..self.end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_view_typed_reads() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut v = View::new(&buf);
        assert_eq!(v.get_u8().unwrap(), 0x01);
        assert_eq!(v.get_u16().unwrap(), 0x0203);
        assert_eq!(v.get_u32().unwrap(), 0x0405_0607);
        assert_eq!(v.remaining(), 1);
        assert_eq!(v.get_u16(), Err(ViewError::Truncated));
    }

    #[test]
    fn core_view_uint_reads_partial_width() {
        let buf = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let mut v = View::new(&buf);
        assert_eq!(v.get_uint(6).unwrap(), 0xaabb_ccdd_eeff);
    }

    #[test]
    fn core_view_commit_rollback() {
        let buf = [1u8, 2, 3, 4, 5, 6];
        let mut v = View::new(&buf);
        v.get_u16().unwrap();
        v.commit();
        assert_eq!(v.committed(), 2);
        v.get_u16().unwrap();
        assert_eq!(v.pending(), 2);
        v.rollback();
        assert_eq!(v.pending(), 0);
        assert_eq!(v.get_u8().unwrap(), 3);
    }

    #[test]
    fn core_view_peek_end() {
        let buf = [0u8, 0, 0xde, 0xad, 0xbe, 0xef];
        let v = View::new(&buf);
        assert_eq!(v.peek_end_u32().unwrap(), 0xdead_beef);
        // Peek does not consume.
        assert_eq!(v.remaining(), 6);
    }

    #[test]
    fn core_view_discard_truncated() {
        let buf = [0u8; 4];
        let mut v = View::new(&buf);
        assert!(v.discard(4).is_ok());
        assert_eq!(v.discard(1), Err(ViewError::Truncated));
    }
}
