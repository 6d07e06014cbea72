//! FIFO byte buffer backed by `slice_deque`: a `SliceDeque<u8>` store with an `ingress`/`egress`
//! split ("pull bytes in off a `Read`" / "push bytes out to a `Write`") and head/tail cursor
//! movement via the crate's `unsafe` `move_head`/`move_tail`/`tail_head_slice` primitives.
//! Chirp keeps one of these per connection for the plaintext side and one for the ciphertext
//! side of the TLS boundary, sized from `Config::buffer_size`.

use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size.saturating_sub(self.data.len())
    }

    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    /// Writes the contents of the buffer to `writer`, advancing the read offset. Returns the
    /// number of bytes actually written before `writer` signalled `WouldBlock` or the buffer
    /// drained.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while self.data.len() > 0 {
            let write_count = match writer.write(&self.data) {
                Ok(n) => n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            };

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.move_head(write_count);
        }

        Ok(orig_len - self.data.len())
    }

    /// Reads available bytes from `reader` into the buffer. Returns the number of bytes
    /// ingested (possibly zero); growing the backing store past `size` by one increment is
    /// allowed so a single oversized read does not get truncated mid-record — the caller
    /// enforces `MAX_MSG_SIZE` at a higher layer.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let orig_len = self.data.len();

        loop {
            if self.free_capacity() == 0 {
                self.data.reserve(self.size.max(1));
            }

            let read_count = match reader.read(unsafe { self.data.tail_head_slice() }) {
                Ok(n) => n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            };

            if read_count == 0 {
                break;
            }

            unsafe { self.move_tail(read_count) };
        }

        Ok(self.data.len() - orig_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel { data, cursor: 0, chunk, max_size }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..32768u32).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(65536);
        buffer.ingress(&mut channel).unwrap();
        assert_eq!(buffer.len(), mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        struct ZeroWriter;
        impl io::Write for ZeroWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = Buffer::new(1024);
        buffer.data.push_back(1);

        let result = buffer.egress(ZeroWriter);
        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_no_err() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buffer = Buffer::new(1024);

        buffer.ingress(&mut cursor).unwrap();
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);

        let mut cursor = Cursor::new(Vec::<u8>::new());
        buffer.egress(&mut cursor).unwrap();
        assert_eq!(buffer.read_slice(), &Vec::<u8>::new()[..]);
        assert_eq!(&cursor.get_ref()[..], &[1, 2, 3]);
    }

    #[test]
    fn move_head_drops_consumed_prefix() {
        let mut buffer = Buffer::new(1024);
        buffer.data.extend(&[1, 2, 3, 4, 5]);
        buffer.move_head(2);
        assert_eq!(buffer.read_slice(), &[3, 4, 5]);
    }
}
