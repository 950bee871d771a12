//! Growable byte buffer with a cheap-prepend region and scattered reads.

use std::io;
use std::os::unix::io::RawFd;

/// Size of the stack-resident secondary buffer used by [`Buffer::read_from_fd`].
const EXTRA_BUF_SIZE: usize = 64 * 1024;

/// Per-connection byte buffer.
///
/// Layout is three regions over one contiguous allocation:
///
/// ```text
/// | prependable |     readable     |    writable    |
/// 0        reader             writer          capacity
/// ```
///
/// The invariant `CHEAP_PREPEND <= reader <= writer <= capacity` holds after
/// every operation; retrieving everything resets both indices to
/// `CHEAP_PREPEND` so the prepend region never shrinks below its fixed size.
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Buffer {
    /// Bytes reserved in front of the readable region for cheap prepends.
    pub const CHEAP_PREPEND: usize = 8;
    /// Default initial capacity of the writable region.
    pub const INITIAL_SIZE: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Self {
            buf: vec![0; Self::CHEAP_PREPEND + initial],
            reader: Self::CHEAP_PREPEND,
            writer: Self::CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    /// Number of bytes in front of the readable region.
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Advance the reader by `len` bytes. Consuming everything resets both
    /// indices to the prepend boundary.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = Self::CHEAP_PREPEND;
        self.writer = Self::CHEAP_PREPEND;
    }

    /// Copy out `len` readable bytes and consume them.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        debug_assert!(len <= self.readable_bytes());
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Copy out `len` readable bytes as a string (lossy) and consume them.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        debug_assert!(len <= self.readable_bytes());
        let out = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Append `data`, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Copy `data` into the space immediately before the readable region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        self.buf[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    /// Make room for at least `len` writable bytes.
    ///
    /// Prefers moving the readable bytes down to the prepend boundary over
    /// growing the allocation.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() < len + Self::CHEAP_PREPEND {
            self.buf.resize(self.writer + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader..self.writer, Self::CHEAP_PREPEND);
            self.reader = Self::CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// Read from `fd` using a two-buffer scattered read: the writable region
    /// plus a 64 KiB stack buffer. Spillover into the stack buffer is
    /// appended afterwards, so one syscall can pick up far more than the
    /// current writable space while idle connections keep a small heap
    /// footprint. Returns `Ok(0)` on EOF.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd`. The caller retrieves whatever was
    /// actually written.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                fd,
                self.peek().as_ptr() as *const libc::c_void,
                self.readable_bytes(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
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

    fn check_invariants(buf: &Buffer) {
        assert!(Buffer::CHEAP_PREPEND <= buf.reader || buf.reader == buf.writer);
        assert!(buf.reader <= buf.writer);
        assert!(buf.writer <= buf.buf.len());
    }

    #[test]
    fn test_new_buffer() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn test_append_and_retrieve() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.peek(), b"hello");

        buf.retrieve(2);
        assert_eq!(buf.peek(), b"llo");
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND + 2);
        check_invariants(&buf);
    }

    #[test]
    fn test_retrieve_all_resets_indices() {
        let mut buf = Buffer::new();
        buf.append(b"data");
        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE);
    }

    #[test]
    fn test_retrieve_exact_length_resets() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(3);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn test_retrieve_as_bytes() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        let head = buf.retrieve_as_bytes(5);
        assert_eq!(head, b"hello");
        assert_eq!(buf.peek(), b" world");
    }

    #[test]
    fn test_retrieve_all_as_string() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.retrieve_all_as_string(), "hello");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_grow_when_insufficient() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[0u8; 100]);
        assert_eq!(buf.readable_bytes(), 100);
        check_invariants(&buf);
    }

    #[test]
    fn test_compact_instead_of_grow() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(&[1u8; 24]);
        buf.retrieve(20);
        let cap_before = buf.buf.len();

        // 4 readable, 8 writable, 28 prependable: room exists after compaction.
        buf.append(&[2u8; 20]);
        assert_eq!(buf.buf.len(), cap_before);
        assert_eq!(buf.readable_bytes(), 24);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
        let mut expected = vec![1u8; 4];
        expected.extend_from_slice(&[2u8; 20]);
        assert_eq!(buf.peek(), &expected[..]);
    }

    #[test]
    fn test_prepend() {
        let mut buf = Buffer::new();
        buf.append(b"body");
        buf.prepend(&4u32.to_be_bytes());
        assert_eq!(buf.readable_bytes(), 8);
        assert_eq!(&buf.peek()[..4], &4u32.to_be_bytes());
        assert_eq!(&buf.peek()[4..], b"body");
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND - 4);
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn write_all(fd: RawFd, data: &[u8]) {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        assert_eq!(n as usize, data.len());
    }

    #[test]
    fn test_read_from_fd() {
        let (r, w) = pipe();
        write_all(w, b"ping");

        let mut buf = Buffer::new();
        let n = buf.read_from_fd(r).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.peek(), b"ping");

        close(r);
        close(w);
    }

    #[test]
    fn test_read_from_fd_eof() {
        let (r, w) = pipe();
        close(w);

        let mut buf = Buffer::new();
        assert_eq!(buf.read_from_fd(r).unwrap(), 0);
        close(r);
    }

    #[test]
    fn test_read_from_fd_spills_into_extra_buffer() {
        let (r, w) = pipe();
        let payload = vec![7u8; 30_000];
        write_all(w, &payload);

        let mut buf = Buffer::with_capacity(16);
        let n = buf.read_from_fd(r).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.readable_bytes(), payload.len());
        assert_eq!(buf.peek(), &payload[..]);
        check_invariants(&buf);

        close(r);
        close(w);
    }

    #[test]
    fn test_write_to_fd() {
        let (r, w) = pipe();

        let mut buf = Buffer::new();
        buf.append(b"pong");
        let n = buf.write_to_fd(w).unwrap();
        assert_eq!(n, 4);
        buf.retrieve(n);
        assert_eq!(buf.readable_bytes(), 0);

        let mut out = [0u8; 8];
        let read = unsafe { libc::read(r, out.as_mut_ptr() as *mut libc::c_void, out.len()) };
        assert_eq!(&out[..read as usize], b"pong");

        close(r);
        close(w);
    }
}
