//! Single-buffer bip queue for interleaved audio or any other byte stream.

use std::fmt;

use super::segmented::{
    ReadGrant, SegmentedBipQueue, SegmentedConsumer, SegmentedProducer, WriteGrant,
};

/// Control handle for a single-segment queue.
#[derive(Clone)]
pub struct BipQueue {
    inner: SegmentedBipQueue,
}

/// Writing half of a [`BipQueue`].
pub struct BipProducer {
    inner: SegmentedProducer,
}

/// Reading half of a [`BipQueue`].
pub struct BipConsumer {
    inner: SegmentedConsumer,
}

impl BipQueue {
    /// Allocate a queue of `capacity` bytes. At most `capacity - 1` bytes are ever buffered.
    pub fn new(capacity: usize) -> (BipProducer, BipConsumer) {
        let (producer, consumer) = SegmentedBipQueue::new(capacity, 1);
        (BipProducer { inner: producer }, BipConsumer { inner: consumer })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn buffered_len(&self) -> usize {
        self.inner.buffered_len()
    }

    /// Rewind the queue to empty and invalidate every grant issued so far.
    ///
    /// # Safety
    ///
    /// Same contract as [`SegmentedBipQueue::reset`]: no slice from
    /// [`BipProducer::as_mut_slice`] or [`BipConsumer::as_slice`] may be alive, and neither
    /// half may be inside a request or commit.
    pub unsafe fn reset(&self) {
        // SAFETY: forwarded to the caller.
        unsafe { self.inner.reset() };
    }
}

impl fmt::Debug for BipQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BipQueue")
            .field("capacity", &self.capacity())
            .field("buffered_len", &self.buffered_len())
            .finish()
    }
}

impl BipProducer {
    pub fn queue(&self) -> BipQueue {
        BipQueue {
            inner: self.inner.queue(),
        }
    }

    pub fn request_write(&mut self, min_size: usize) -> Option<WriteGrant> {
        self.inner.request_write(min_size)
    }

    pub fn as_mut_slice(&mut self, grant: WriteGrant) -> &mut [u8] {
        self.inner.region(grant).into_segment_mut(0)
    }

    pub fn commit_write(&mut self, size: usize) {
        self.inner.commit_write(size);
    }

    /// Copy as much of `data` as fits, across at most two contiguous spans.
    ///
    /// Returns the number of bytes accepted.
    pub fn push_slice(&mut self, data: &[u8]) -> usize {
        let mut written = 0;
        while written < data.len() {
            let Some(grant) = self.request_write(1) else {
                break;
            };
            let dst = self.as_mut_slice(grant);
            let take = dst.len().min(data.len() - written);
            dst[..take].copy_from_slice(&data[written..written + take]);
            self.commit_write(take);
            written += take;
        }
        written
    }
}

impl BipConsumer {
    pub fn queue(&self) -> BipQueue {
        BipQueue {
            inner: self.inner.queue(),
        }
    }

    pub fn request_read(&mut self) -> Option<ReadGrant> {
        self.inner.request_read()
    }

    pub fn as_slice(&self, grant: ReadGrant) -> &[u8] {
        self.inner.region(grant).segment(0)
    }

    pub fn commit_read(&mut self, size: usize) {
        self.inner.commit_read(size);
    }

    /// Drain up to `out.len()` bytes in FIFO order. Returns the number copied.
    pub fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let mut read = 0;
        while read < out.len() {
            let Some(grant) = self.request_read() else {
                break;
            };
            let src = self.as_slice(grant);
            let take = src.len().min(out.len() - read);
            out[read..read + take].copy_from_slice(&src[..take]);
            self.commit_read(take);
            read += take;
        }
        read
    }
}
