use std::io;

// Compact once the dead prefix outgrows this many bytes.
const COMPACT_THRESHOLD: usize = 64 * 1024;

const INGRESS_CHUNK: usize = 16 * 1024;

/// A dynamically sized buffered FIFO byte queue. Data is appended at the tail
/// and consumed from the head; the unread region is always available as a
/// contiguous slice.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer {
            data: Vec::new(),
            head: 0,
        }
    }

    /// The number of unread bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Returns true in case the buffer holds no unread data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.data.len()
    }

    /// Slice containing the unread data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Advance the head past `count` consumed bytes.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.head += count;

        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head > COMPACT_THRESHOLD {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Append raw bytes at the tail.
    #[inline]
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Read from the supplied reader until it would block, the peer closes,
    /// or `cap` unread bytes accumulate. Returns the number of bytes added;
    /// `Ok(0)` only when the reader reported end-of-stream immediately.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R, cap: usize) -> io::Result<usize> {
        let mut total = 0;

        while self.len() < cap {
            let tail = self.data.len();
            self.data.resize(tail + INGRESS_CHUNK, 0);

            match reader.read(&mut self.data[tail..]) {
                Ok(count) => {
                    self.data.truncate(tail + count);
                    if count == 0 {
                        return Ok(total);
                    }
                    total += count;
                }
                Err(err) => {
                    self.data.truncate(tail);
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    if err.kind() == io::ErrorKind::WouldBlock && total > 0 {
                        return Ok(total);
                    }
                    return Err(err);
                }
            }
        }

        Ok(total)
    }

    /// Write the buffered data to the supplied writer, advancing the head.
    /// Stops early when the writer would block.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;

        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    if err.kind() == io::ErrorKind::WouldBlock && total > 0 {
                        return Ok(total);
                    }
                    return Err(err);
                }
            }
        }

        Ok(total)
    }
}

impl io::Write for Buffer {
    #[inline]
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
