//! Growable byte buffer with prependable, readable and writable regions.
//!
//! Layout invariant: `0 <= read_index <= write_index <= storage.len()`,
//! with 8 bytes reserved in front so a length or framing prefix can be
//! prepended without moving data. Integer codecs use network byte order.

use std::io;
use std::os::unix::io::RawFd;

use crate::sys;

pub const CHEAP_PREPEND: usize = 8;
pub const INITIAL_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Buffer {
            storage: vec![0; CHEAP_PREPEND + initial_size],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// View of the readable region. Not stable across mutation; callers
    /// must not hold it over an `append` or `retrieve`.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(len)).into_owned()
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        let len = self.readable_bytes();
        self.retrieve_as_string(len)
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.write_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Write into the reserved region in front of the readable bytes.
    /// Panics if more than `prependable_bytes()` is asked for.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_index -= data.len();
        let start = self.read_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
    }

    fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            // Grow the backing storage.
            self.storage.resize(self.write_index + len, 0);
        } else {
            // Move readable bytes down to the prepend reserve.
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
    }

    /// Offset of the first CRLF in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Offset of the first CRLF at or after `start`.
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        self.peek()[start..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|pos| start + pos)
    }

    /// Offset of the first LF in the readable region.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    // ---- Integer codecs (network byte order) ----

    pub fn append_i8(&mut self, x: i8) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i16(&mut self, x: i16) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i32(&mut self, x: i32) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i64(&mut self, x: i64) {
        self.append(&x.to_be_bytes());
    }

    pub fn peek_i8(&self) -> i8 {
        assert!(self.readable_bytes() >= 1);
        self.peek()[0] as i8
    }

    pub fn peek_i16(&self) -> i16 {
        assert!(self.readable_bytes() >= 2);
        i16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_i32(&self) -> i32 {
        assert!(self.readable_bytes() >= 4);
        i32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_i64(&self) -> i64 {
        assert!(self.readable_bytes() >= 8);
        i64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    pub fn read_i8(&mut self) -> i8 {
        let x = self.peek_i8();
        self.retrieve(1);
        x
    }

    pub fn read_i16(&mut self) -> i16 {
        let x = self.peek_i16();
        self.retrieve(2);
        x
    }

    pub fn read_i32(&mut self) -> i32 {
        let x = self.peek_i32();
        self.retrieve(4);
        x
    }

    pub fn read_i64(&mut self) -> i64 {
        let x = self.peek_i64();
        self.retrieve(8);
        x
    }

    // ---- Socket I/O ----

    /// One vectored read into (writable region, 64 KiB stack scratch).
    /// A burst larger than the writable region is absorbed in a single
    /// syscall: the overflow lands in the scratch and is appended.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let mut vec = [
            libc::iovec {
                iov_base: unsafe { self.storage.as_mut_ptr().add(self.write_index) }
                    as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, vec.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.storage.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    /// One write from the readable region; advances past what was taken.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = sys::write(fd, self.peek())?;
        self.retrieve(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_retrieve_roundtrip() {
        let mut buf = Buffer::new();
        buf.append(b"hello, world");
        assert_eq!(buf.readable_bytes(), 12);
        assert_eq!(buf.retrieve_all_as_string(), "hello, world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn partial_retrieve_advances() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.retrieve(2);
        assert_eq!(buf.peek(), b"cdef");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 2);
        buf.retrieve(100);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn int_codecs_roundtrip() {
        let mut buf = Buffer::new();
        buf.append_i8(-5);
        buf.append_i16(-300);
        buf.append_i32(0x1234_5678);
        buf.append_i64(-0x1122_3344_5566_7788);
        assert_eq!(buf.read_i8(), -5);
        assert_eq!(buf.read_i16(), -300);
        assert_eq!(buf.read_i32(), 0x1234_5678);
        assert_eq!(buf.read_i64(), -0x1122_3344_5566_7788);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn int_codecs_are_big_endian() {
        let mut buf = Buffer::new();
        buf.append_i32(1);
        assert_eq!(buf.peek(), &[0, 0, 0, 1]);
    }

    #[test]
    fn peek_i64_reads_eight_bytes() {
        let mut buf = Buffer::new();
        buf.append(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(buf.peek_i64(), 0x0102_0304_0506_0708);
        // Peek does not advance.
        assert_eq!(buf.readable_bytes(), 8);
    }

    #[test]
    fn growth_beyond_capacity() {
        let mut buf = Buffer::with_capacity(16);
        let data = vec![0xAB; 4000];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 4000);
        assert_eq!(buf.peek(), &data[..]);
    }

    #[test]
    fn compaction_reuses_prepend_space() {
        let mut buf = Buffer::with_capacity(64);
        buf.append(&[1u8; 48]);
        buf.retrieve(40);
        let cap_before = buf.capacity();
        // 8 readable remain; 40 + 8 prependable + 16 writable can host 50
        // more without growing.
        buf.append(&[2u8; 50]);
        assert_eq!(buf.capacity(), cap_before);
        assert_eq!(buf.readable_bytes(), 58);
        assert_eq!(&buf.peek()[..8], &[1u8; 8]);
        assert_eq!(&buf.peek()[8..], &[2u8; 50]);
    }

    #[test]
    fn prepend_fills_reserve() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&(7i32).to_be_bytes());
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.read_i32(), 7);
        assert_eq!(buf.retrieve_all_as_string(), "payload");
    }

    #[test]
    fn find_crlf_offsets() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_crlf_from(16), Some(23));
        buf.retrieve_all();
        buf.append(b"no line ending yet");
        assert_eq!(buf.find_crlf(), None);
        assert_eq!(buf.find_eol(), None);
    }

    #[test]
    fn read_fd_small_message() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let msg = b"fragmented network read";
        unsafe {
            libc::write(fds[1], msg.as_ptr() as *const libc::c_void, msg.len());
        }

        let mut buf = Buffer::new();
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, msg.len());
        assert_eq!(buf.peek(), msg);

        sys::close_fd(fds[0]);
        sys::close_fd(fds[1]);
    }

    #[test]
    fn read_fd_burst_overflows_into_scratch() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let msg = vec![0x5A_u8; 8000];
        unsafe {
            libc::write(fds[1], msg.as_ptr() as *const libc::c_void, msg.len());
        }

        // Writable region is far smaller than the burst.
        let mut buf = Buffer::with_capacity(128);
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, 8000);
        assert_eq!(buf.readable_bytes(), 8000);
        assert!(buf.peek().iter().all(|&b| b == 0x5A));

        sys::close_fd(fds[0]);
        sys::close_fd(fds[1]);
    }
}
