use super::MirroredRing;
use std::io::{self, Read, Write};

impl Read for MirroredRing<u8> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len_to_copy = self.len().min(buf.len());
        if len_to_copy == 0 {
            return Ok(0);
        }
        buf[..len_to_copy].copy_from_slice(&self.as_slice()[..len_to_copy]);
        self.consume(len_to_copy).map_err(io::Error::other)?;
        Ok(len_to_copy)
    }
}

/// Writes are bounded by the free space: a full ring accepts zero bytes,
/// which `write_all` turns into [`io::ErrorKind::WriteZero`].
impl Write for MirroredRing<u8> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len_to_copy = self.free_space().min(buf.len());
        self.free_slice_mut()[..len_to_copy].copy_from_slice(&buf[..len_to_copy]);
        self.produce(len_to_copy).map_err(io::Error::other)?;
        Ok(len_to_copy)
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}
