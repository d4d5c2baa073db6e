use super::MirroredRing;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

// Nothing here waits: an empty ring reads as EOF and a full ring accepts zero bytes.

impl AsyncRead for MirroredRing<u8> {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let len_to_copy = self.len().min(buf.remaining());
        buf.put_slice(&self.as_slice()[..len_to_copy]);
        Poll::Ready(self.consume(len_to_copy).map_err(io::Error::other))
    }
}

impl AsyncWrite for MirroredRing<u8> {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        let len_to_copy = self.free_space().min(buf.len());
        self.free_slice_mut()[..len_to_copy].copy_from_slice(&buf[..len_to_copy]);
        Poll::Ready(self.produce(len_to_copy).map(|()| len_to_copy).map_err(io::Error::other))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> { Poll::Ready(Ok(())) }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> { Poll::Ready(Ok(())) }
}
