use super::MirroredRing;
use bytes::{Buf, BufMut, buf::UninitSlice};

impl Buf for MirroredRing<u8> {
    #[inline]
    fn remaining(&self) -> usize { self.len() }

    /// The whole unconsumed region, even when it wraps.
    #[inline]
    fn chunk(&self) -> &[u8] { self.as_slice() }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.len(), "cannot advance past the end of the buffer");
        let _ = self.consume(cnt);
    }
}

unsafe impl BufMut for MirroredRing<u8> {
    #[inline]
    fn remaining_mut(&self) -> usize { self.free_space() }

    #[inline]
    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(cnt <= self.free_space(), "cannot advance past the buffer's capacity");
        let _ = self.produce(cnt);
    }

    /// The whole free region, even when it wraps.
    #[inline]
    fn chunk_mut(&mut self) -> &mut UninitSlice { UninitSlice::new(self.free_slice_mut()) }

    #[inline]
    fn put_slice(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.free_space(),
            "put_slice of {} bytes with only {} free",
            src.len(),
            self.free_space()
        );
        let _ = self.push_slice(src);
    }
}
