use crate::rate::MovingAverage;

const MAX_BUF_SIZE: usize = 1024 * 1024;

/// Receive-side byte buffer with separate read and write cursors.
///
/// The socket loop reserves space, reads into it and advances the write
/// cursor; the message parser consumes from the read cursor. Both sides may
/// leave the buffer partially filled between readiness events.
pub struct RecvBuffer {
    buf: Vec<u8>,
    lo: usize,
    hi: usize,
    write_rate: MovingAverage,
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl RecvBuffer {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: vec![0; cap],
            lo: 0,
            hi: 0,
            write_rate: MovingAverage::new(10),
        }
    }

    /// Number of bytes written but not yet consumed.
    pub fn unread(&self) -> usize {
        self.hi - self.lo
    }

    /// Ensure at least `len` unread bytes can be buffered and return the
    /// writable tail. Returns an empty slice if `len` bytes are already
    /// buffered.
    pub fn write_reserve(&mut self, len: usize) -> &mut [u8] {
        if self.unread() >= len {
            return &mut [];
        }

        self.compact(len);

        if self.lo + len > self.buf.len() {
            self.buf.resize(self.lo + len, 0);
        }

        &mut self.buf[self.hi..]
    }

    /// Record that `n` bytes were written into the reserved tail.
    ///
    /// Grows the buffer when reads keep filling most of it, up to a 1 MiB
    /// cap.
    pub fn advance_write(&mut self, n: usize) {
        self.hi += n;
        debug_assert!(self.hi <= self.buf.len());

        self.write_rate.add_sample(n as i64);
        if self.write_rate.mean() as usize >= self.buf.len() * 90 / 100 {
            let new_len = MAX_BUF_SIZE.min(self.buf.len() * 3 / 2);
            self.buf.resize(new_len.max(self.buf.len()), 0);
        }
    }

    /// Peek the next unread byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        if self.lo < self.hi {
            Some(self.buf[self.lo])
        } else {
            None
        }
    }

    /// Consume and return `n` unread bytes. Caller checks `unread()` first.
    pub fn read(&mut self, n: usize) -> &[u8] {
        debug_assert!(n <= self.unread());
        let out = &self.buf[self.lo..self.lo + n];
        self.lo += n;
        out
    }

    /// Consume `N` bytes into a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0; N];
        out.copy_from_slice(self.read(N));
        out
    }

    fn compact(&mut self, needed: usize) {
        if self.lo == 0 {
            return;
        }

        if self.unread() == 0 {
            self.lo = 0;
            self.hi = 0;
            return;
        }

        if self.lo + needed <= self.buf.len() {
            return;
        }

        self.buf.copy_within(self.lo..self.hi, 0);
        self.hi -= self.lo;
        self.lo = 0;
    }
}
