use std::{io, os::fd::RawFd};

/// Netty-style byte buffer: one contiguous store split into prependable,
/// readable and writable zones.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |    (CONTENT)     |                  |
/// +-------------------+------------------+------------------+
/// 0        <=       reader      <=     writer      <=     size
/// ```
///
/// The 8-byte reserve in front of the content lets framing headers be
/// prepended in place, without copying the payload.
pub struct Buffer {
    data: Vec<u8>,
    reader: usize,
    writer: usize,
}

pub const CHEAP_PREPEND: usize = 8;
pub const INITIAL_SIZE: usize = 1024;

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: vec![0; CHEAP_PREPEND + INITIAL_SIZE],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    pub fn with_data(data: &[u8]) -> Self {
        let mut buffer = Self::new();
        buffer.append(data);
        buffer
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.writer
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// The readable zone as one contiguous span.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader..self.writer]
    }

    pub fn consume(&mut self, len: usize) {
        assert!(len <= self.readable_bytes(), "consuming past the readable zone");
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.consume_all();
        }
    }

    pub fn consume_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    pub fn consume_all_as_vec(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.consume_all();
        out
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    pub fn append_u8(&mut self, value: u8) {
        self.append(&[value]);
    }

    pub fn append_i16(&mut self, value: i16) {
        self.append(&value.to_be_bytes());
    }

    pub fn append_i32(&mut self, value: i32) {
        self.append(&value.to_be_bytes());
    }

    pub fn peek_i32(&self) -> i32 {
        assert!(self.readable_bytes() >= 4, "peeking i32 past the readable zone");
        i32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn read_i32(&mut self) -> i32 {
        let value = self.peek_i32();
        self.consume(4);
        value
    }

    /// Prepending never reallocates: the reserve in front of the content
    /// is maintained across compaction exactly for this.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes(), "prepend reserve exhausted");
        self.reader -= data.len();
        self.data[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    pub fn prepend_i32(&mut self, value: i32) {
        self.prepend(&value.to_be_bytes());
    }

    /// Makes room for `len` more bytes: compacts toward the reserve when
    /// the total free space suffices, otherwise grows by doubling.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.prependable_bytes() + self.writable_bytes() >= len + CHEAP_PREPEND {
            let readable = self.readable_bytes();
            self.data.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = CHEAP_PREPEND + readable;
        } else {
            let needed = self.writer + len;
            let mut new_len = self.data.len().max(1);
            while new_len < needed {
                new_len *= 2;
            }
            self.data.resize(new_len, 0);
        }
    }

    /// Offset of the first CRLF in the readable zone, relative to the
    /// read cursor.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|pair| pair == b"\r\n")
    }

    /// Scatter-gather read: fills the writable zone first, spilling into
    /// a 64 KiB stack scratch region that is appended afterwards. One
    /// syscall reads up to writable + 64 KiB regardless of buffer size.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.data[self.writer..].as_mut_ptr().cast::<libc::c_void>(),
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr().cast::<libc::c_void>(),
                iov_len: extra.len(),
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zones_add_up() {
        let mut buffer = Buffer::new();
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);

        buffer.append(b"hello");
        assert_eq!(buffer.readable_bytes(), 5);
        assert_eq!(buffer.peek(), b"hello");

        buffer.consume(2);
        assert_eq!(buffer.peek(), b"llo");
        assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND + 2);

        buffer.consume(3);
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn prepend_uses_reserve_without_moving_content() {
        let mut buffer = Buffer::new();
        buffer.append(b"payload");
        buffer.prepend_i32(7);
        buffer.prepend_i32(11);
        assert_eq!(buffer.prependable_bytes(), 0);
        assert_eq!(buffer.read_i32(), 11);
        assert_eq!(buffer.read_i32(), 7);
        assert_eq!(buffer.peek(), b"payload");
    }

    #[test]
    fn prepend_survives_many_append_consume_rounds() {
        let mut buffer = Buffer::new();
        for _ in 0..200 {
            buffer.append(&[0xab; 400]);
            buffer.consume(400);
        }
        buffer.append(b"x");
        assert!(buffer.prependable_bytes() >= CHEAP_PREPEND);
        buffer.prepend(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buffer.readable_bytes(), 9);
    }

    #[test]
    fn compacts_instead_of_growing_when_possible() {
        let mut buffer = Buffer::new();
        buffer.append(&vec![1u8; 900]);
        buffer.consume(800);
        let size_before = buffer.data.len();
        // 100 readable, room exists after compaction.
        buffer.append(&vec![2u8; 900]);
        assert_eq!(buffer.data.len(), size_before);
        assert_eq!(buffer.readable_bytes(), 1000);
        assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn grows_by_doubling() {
        let mut buffer = Buffer::new();
        buffer.append(&vec![0u8; 3000]);
        assert_eq!(buffer.readable_bytes(), 3000);
        assert!(buffer.data.len() >= 3000 + CHEAP_PREPEND);
    }

    #[test]
    fn big_endian_integers_round_trip() {
        let mut buffer = Buffer::new();
        buffer.append_i32(0x0102_0304);
        assert_eq!(buffer.peek(), &[1, 2, 3, 4]);
        assert_eq!(buffer.peek_i32(), 0x0102_0304);
        assert_eq!(buffer.read_i32(), 0x0102_0304);
        assert_eq!(buffer.readable_bytes(), 0);
    }

    #[test]
    fn finds_crlf() {
        let mut buffer = Buffer::new();
        buffer.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buffer.find_crlf(), Some(14));
        buffer.consume(16);
        assert_eq!(buffer.find_crlf(), Some(7));
    }
}
