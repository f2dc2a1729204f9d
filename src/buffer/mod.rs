//! Growable byte buffer with independent read and write cursors.
//!
//! [`ByteBuffer`] is the per-connection staging area for socket I/O. Bytes are
//! appended at the write cursor and consumed from the read cursor:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! 0      <=       read_pos    <=     write_pos    <=     capacity
//! ```
//!
//! When an append does not fit, the buffer first tries to reclaim the
//! already-consumed prefix by compacting in place and only grows its storage
//! when that is not enough.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};

use bytes::{Buf, Bytes};

/// Default initial capacity of a connection buffer.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack scratch area used by [`ByteBuffer::read_from`].
const EXTRA_BUF_LEN: usize = 64 * 1024;

/// A growable byte buffer with split read/write cursors.
///
/// # Examples
///
/// ```
/// use rttpd::buffer::ByteBuffer;
///
/// let mut buf = ByteBuffer::new(16);
/// buf.append(b"GET / HTTP/1.1\r\n");
/// assert_eq!(buf.readable_bytes(), 16);
///
/// buf.retrieve(4);
/// assert_eq!(buf.peek(), b"/ HTTP/1.1\r\n");
/// assert_eq!(buf.retrieve_all_as_string(), "/ HTTP/1.1\r\n");
/// assert_eq!(buf.readable_bytes(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl ByteBuffer {
    /// Creates a buffer with `capacity` writable bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes that can be appended without compacting or growing.
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    /// Number of already-consumed bytes in front of the read cursor.
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// Total size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Returns the readable region without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Returns the offset (relative to [`peek`](Self::peek)) of the first
    /// occurrence of `needle` in the readable region.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        self.peek()
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Makes sure at least `len` bytes can be appended.
    ///
    /// Compacts the unread bytes to offset zero when the consumed prefix plus
    /// the writable tail is large enough; otherwise resizes the storage to
    /// `write_pos + len + 1`.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Appends `data` at the write cursor, growing or compacting as needed.
    pub fn append(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        self.ensure_writable(data.len());
        self.storage[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Consumes `len` readable bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`readable_bytes`](Self::readable_bytes).
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes(), "retrieve past write cursor");
        if len == self.readable_bytes() {
            self.retrieve_all();
        } else {
            self.read_pos += len;
        }
    }

    /// Consumes everything up to and including the first occurrence of
    /// `marker`. Returns the number of bytes consumed, or `None` (consuming
    /// nothing) when the marker is absent.
    pub fn retrieve_until(&mut self, marker: &[u8]) -> Option<usize> {
        let end = self.find(marker)? + marker.len();
        self.retrieve(end);
        Some(end)
    }

    /// Discards all content and resets both cursors to zero.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Drains the readable region into a `String` (invalid UTF-8 is replaced).
    pub fn retrieve_all_as_string(&mut self) -> String {
        let text = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        text
    }

    /// Performs a single scatter read from `reader`.
    ///
    /// The first region is the buffer's writable tail, the second a 64 KiB
    /// scratch area on the stack, so one call can absorb a large burst without
    /// resizing up front. Whatever lands in the scratch area is appended
    /// afterwards. Returns the number of bytes read; `Ok(0)` means end of
    /// stream.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_LEN];
        let writable = self.writable_bytes();

        let n = {
            let tail = &mut self.storage[self.write_pos..];
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            reader.read_vectored(&mut iov)?
        };

        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Performs a single write of the readable region to `writer` and
    /// consumes whatever was accepted.
    pub fn write_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write_vectored(&[IoSlice::new(self.peek())])?;
        self.retrieve(n);
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.storage.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new(INITIAL_SIZE)
    }
}

impl Buf for ByteBuffer {
    fn remaining(&self) -> usize {
        self.readable_bytes()
    }

    fn chunk(&self) -> &[u8] {
        self.peek()
    }

    fn advance(&mut self, cnt: usize) {
        self.retrieve(cnt);
    }

    /// One copy out of the readable region; the cursor then moves past it.
    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        let out = Bytes::copy_from_slice(&self.peek()[..len]);
        self.retrieve(len);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn append_and_peek() {
        let mut buf = ByteBuffer::new(8);
        buf.append("hello");
        assert_eq!(buf.peek(), b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.writable_bytes(), 3);
        assert_eq!(buf.prependable_bytes(), 0);
    }

    #[test]
    fn grows_when_prefix_is_too_small() {
        let mut buf = ByteBuffer::new(4);
        buf.append(b"abcd");
        buf.retrieve(1);
        buf.append(b"efghij");
        // 0 writable + 1 prependable < 6 requested: resized to write_pos + len + 1.
        assert_eq!(buf.capacity(), 4 + 6 + 1);
        assert_eq!(buf.peek(), b"bcdefghij");
    }

    #[test]
    fn compacts_when_prefix_is_large_enough() {
        let mut buf = ByteBuffer::new(8);
        buf.append(b"abcdefgh");
        buf.retrieve(6);
        buf.append(b"xyz");
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.prependable_bytes(), 0);
        assert_eq!(buf.peek(), b"ghxyz");
    }

    #[test]
    fn retrieve_until_marker() {
        let mut buf = ByteBuffer::default();
        buf.append(b"line one\r\nline two\r\n");
        assert_eq!(buf.retrieve_until(b"\r\n"), Some(10));
        assert_eq!(buf.peek(), b"line two\r\n");
        assert_eq!(buf.retrieve_until(b"\n\n"), None);
        assert_eq!(buf.readable_bytes(), 10);
    }

    #[test]
    fn full_retrieve_resets_cursors() {
        let mut buf = ByteBuffer::new(16);
        buf.append(b"0123456789");
        buf.retrieve(10);
        assert_eq!(buf.prependable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), 16);
    }

    #[test]
    #[should_panic(expected = "retrieve past write cursor")]
    fn retrieve_too_much_panics() {
        let mut buf = ByteBuffer::new(4);
        buf.append(b"ab");
        buf.retrieve(3);
    }

    #[test]
    fn read_from_spills_into_scratch_area() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut buf = ByteBuffer::new(16);
        let mut reader = Cursor::new(payload.clone());

        let mut total = 0;
        loop {
            let n = buf.read_from(&mut reader).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, payload.len());
        assert_eq!(buf.peek(), payload.as_slice());
    }

    #[test]
    fn write_to_consumes_accepted_bytes() {
        let mut buf = ByteBuffer::default();
        buf.append(b"response bytes");
        let mut sink = Vec::new();
        let n = buf.write_to(&mut sink).unwrap();
        assert_eq!(n, 14);
        assert_eq!(sink, b"response bytes");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn buf_trait_reads_through_cursor() {
        let mut buf = ByteBuffer::default();
        buf.append([0x01, 0x02, 0x03, 0x04, 0xff]);
        assert_eq!(buf.get_u32(), 0x0102_0304);
        assert_eq!(buf.get_u8(), 0xff);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn copy_to_bytes_takes_prefix() {
        let mut buf = ByteBuffer::default();
        buf.append(b"username=a&password=b");
        let body = buf.copy_to_bytes(10);
        assert_eq!(&body[..], b"username=a");
        assert_eq!(buf.peek(), b"&password=b");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Append(Vec<u8>),
        Retrieve(usize),
        Ensure(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..300).prop_map(Op::Append),
            (0usize..400).prop_map(Op::Retrieve),
            (0usize..2048).prop_map(Op::Ensure),
        ]
    }

    proptest! {
        #[test]
        fn chunked_appends_round_trip(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            cuts in proptest::collection::vec(0usize..4096, 0..16),
        ) {
            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(data.len())).collect();
            cuts.sort_unstable();

            let mut buf = ByteBuffer::new(8);
            let mut start = 0;
            for cut in cuts.into_iter().chain(std::iter::once(data.len())) {
                buf.append(&data[start..cut]);
                start = cut;
            }

            let out = buf.copy_to_bytes(buf.remaining());
            prop_assert_eq!(&out[..], data.as_slice());
        }

        #[test]
        fn cursor_invariant_holds(ops in proptest::collection::vec(op(), 0..64)) {
            let mut buf = ByteBuffer::new(32);
            let mut model: Vec<u8> = Vec::new();

            for op in ops {
                match op {
                    Op::Append(bytes) => {
                        buf.append(&bytes);
                        model.extend_from_slice(&bytes);
                    }
                    Op::Retrieve(n) => {
                        let n = n.min(buf.readable_bytes());
                        buf.retrieve(n);
                        model.drain(..n);
                    }
                    Op::Ensure(n) => {
                        buf.ensure_writable(n);
                        prop_assert!(buf.writable_bytes() >= n);
                    }
                }
                prop_assert!(buf.prependable_bytes() + buf.readable_bytes() + buf.writable_bytes() == buf.capacity());
                prop_assert_eq!(buf.peek(), model.as_slice());
            }
        }
    }
}
