use std::io::{self, IoSliceMut};

use crate::sys::socket::Socket;

/// Bytes reserved at the front of every buffer so a length header can be
/// prepended to an already-assembled message without copying the payload.
pub const PREPEND_SIZE: usize = 8;

const INITIAL_SIZE: usize = 1024;

/// The `read_fd` scratch area lives on the stack, not in the buffer, so a
/// connection that never receives a huge datagram never pays for one.
const SCRATCH_SIZE: usize = 65536;

/// A growable byte queue split into three regions by two indices:
///
/// ```text
/// [ 0 .. prepend .. read | readable bytes | write | writable bytes .. capacity ]
/// ```
///
/// `0 <= prepend <= read <= write <= capacity` always holds. Grown by
/// compacting the readable region down to the prepend boundary when there
/// is enough slack, or by reallocating when there isn't (see `ensure_writable`).
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read: usize,
    write: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; PREPEND_SIZE + capacity],
            read: PREPEND_SIZE,
            write: PREPEND_SIZE,
        }
    }

    pub fn readable_len(&self) -> usize {
        self.write - self.read
    }

    pub fn writable_len(&self) -> usize {
        self.buf.len() - self.write
    }

    pub fn prependable_len(&self) -> usize {
        self.read
    }

    pub fn is_empty(&self) -> bool {
        self.readable_len() == 0
    }

    /// The readable region, unconsumed.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    /// Advances the read index by `n`. Resets both indices to the prepend
    /// boundary if that consumes every readable byte, the same reset
    /// `retrieve_all` performs, so a drained buffer never needs a separate
    /// compaction pass before its next `append`.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_len());
        if n < self.readable_len() {
            self.read += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read = PREPEND_SIZE;
        self.write = PREPEND_SIZE;
    }

    /// Consumes and returns the first `n` readable bytes as an owned vector.
    pub fn retrieve_as_vec(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_len());
        let v = self.buf[self.read..self.read + n].to_vec();
        self.retrieve(n);
        v
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let n = self.readable_len();
        self.retrieve_as_vec(n)
    }

    /// Appends `data` to the writable region, growing first if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.write += data.len();
    }

    /// Grows the writable region to hold at least `len` more bytes: if
    /// compacting (sliding the readable region down to the prepend
    /// boundary) would free enough room, compact; otherwise reallocate to
    /// exactly fit.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_len() >= len {
            return;
        }
        if self.writable_len() + (self.read - PREPEND_SIZE) >= len {
            self.compact();
        } else {
            let new_len = self.write + len;
            self.buf.resize(new_len, 0);
        }
    }

    /// Slides the readable region down to the prepend boundary. A no-op if
    /// it is already there (§8's compaction-idempotence law).
    fn compact(&mut self) {
        if self.read == PREPEND_SIZE {
            return;
        }
        let readable = self.readable_len();
        self.buf.copy_within(self.read..self.write, PREPEND_SIZE);
        self.read = PREPEND_SIZE;
        self.write = PREPEND_SIZE + readable;
    }

    /// Writes `data` into the prepend region, decrementing the read index.
    /// Panics if the prepend region has been exhausted — callers prepend
    /// at most one header per assembled message, per the fixed
    /// 8-byte prepend region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_len(), "prepend region exhausted");
        self.read -= data.len();
        self.buf[self.read..self.read + data.len()].copy_from_slice(data);
    }

    /// Scatter-reads from `fd` into the writable tail, spilling overflow
    /// into a stack-local scratch area so one large arrival doesn't force
    /// a pre-sized buffer for every connection's steady state.
    pub fn read_fd(&mut self, fd: &Socket) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let writable = self.writable_len();

        let n = {
            let mut slices = [
                IoSliceMut::new(&mut self.buf[self.write..]),
                IoSliceMut::new(&mut scratch),
            ];
            fd.readv(&mut slices)?
        };

        if n <= writable {
            self.write += n;
        } else {
            self.write = self.buf.len();
            self.append(&scratch[..n - writable]);
        }

        Ok(n)
    }

    pub fn append_u8(&mut self, n: u8) {
        self.append(&n.to_be_bytes());
    }

    pub fn append_u16(&mut self, n: u16) {
        self.append(&n.to_be_bytes());
    }

    pub fn append_u32(&mut self, n: u32) {
        self.append(&n.to_be_bytes());
    }

    pub fn append_u64(&mut self, n: u64) {
        self.append(&n.to_be_bytes());
    }

    pub fn prepend_u8(&mut self, n: u8) {
        self.prepend(&n.to_be_bytes());
    }

    pub fn prepend_u16(&mut self, n: u16) {
        self.prepend(&n.to_be_bytes());
    }

    pub fn prepend_u32(&mut self, n: u32) {
        self.prepend(&n.to_be_bytes());
    }

    pub fn prepend_u64(&mut self, n: u64) {
        self.prepend(&n.to_be_bytes());
    }

    pub fn peek_u8(&self) -> u8 {
        self.peek()[0]
    }

    pub fn peek_u16(&self) -> u16 {
        u16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_u32(&self) -> u32 {
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_u64(&self) -> u64 {
        u64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    pub fn read_u8(&mut self) -> u8 {
        let n = self.peek_u8();
        self.retrieve(1);
        n
    }

    pub fn read_u16(&mut self) -> u16 {
        let n = self.peek_u16();
        self.retrieve(2);
        n
    }

    pub fn read_u32(&mut self) -> u32 {
        let n = self.peek_u32();
        self.retrieve(4);
        n
    }

    pub fn read_u64(&mut self) -> u64 {
        let n = self.peek_u64();
        self.retrieve(8);
        n
    }
}
