//! Segmented bip queue: one offset set driving `segment_count` parallel byte buffers.
//!
//! Non-interleaved audio keeps one segment per channel. A single commit of `n` bytes advances
//! every segment by `n` bytes at once, so channels can never drift apart.

use std::fmt;
use std::sync::Arc;

use super::shared::{BipShared, Span};

/// Control handle for a segmented queue.
///
/// Cloneable and cheap; it cannot read or write data, only observe and reset the queue.
#[derive(Clone)]
pub struct SegmentedBipQueue {
    shared: Arc<BipShared>,
}

/// A span the producer may fill, as returned by [`SegmentedProducer::request_write`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteGrant {
    offset: usize,
    len: usize,
    epoch: u64,
}

/// A span the consumer may read, as returned by [`SegmentedConsumer::request_read`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadGrant {
    offset: usize,
    len: usize,
    epoch: u64,
}

impl WriteGrant {
    /// Writable bytes in each segment.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ReadGrant {
    /// Readable bytes in each segment.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Writing half. Exactly one thread owns it.
pub struct SegmentedProducer {
    shared: Arc<BipShared>,
    granted: Option<WriteGrant>,
}

/// Reading half. Exactly one thread owns it.
pub struct SegmentedConsumer {
    shared: Arc<BipShared>,
    granted: Option<ReadGrant>,
}

/// Mutable view over the current write grant.
pub struct SegmentedWriteRegion<'a> {
    shared: &'a BipShared,
    span: Span,
}

/// Shared view over the current read grant.
pub struct SegmentedReadRegion<'a> {
    shared: &'a BipShared,
    span: Span,
}

impl SegmentedBipQueue {
    /// Allocate a queue of `segment_count` buffers of `segment_size` bytes each.
    ///
    /// Panics if `segment_size < 2` or `segment_count == 0`.
    pub fn new(segment_size: usize, segment_count: usize) -> (SegmentedProducer, SegmentedConsumer) {
        let shared = Arc::new(BipShared::new(segment_size, segment_count));
        (
            SegmentedProducer {
                shared: shared.clone(),
                granted: None,
            },
            SegmentedConsumer {
                shared,
                granted: None,
            },
        )
    }

    pub fn segment_size(&self) -> usize {
        self.shared.segment_size()
    }

    pub fn segment_count(&self) -> usize {
        self.shared.segment_count()
    }

    /// Total bytes across all segments.
    pub fn capacity(&self) -> usize {
        self.shared.segment_size() * self.shared.segment_count()
    }

    /// Bytes per segment committed but not yet consumed. May be stale immediately.
    pub fn buffered_len(&self) -> usize {
        self.shared.buffered_len()
    }

    /// Rewind the queue to empty and invalidate every grant issued so far.
    ///
    /// # Safety
    ///
    /// Neither half may be mid-operation: the producer must not hold a write region or be
    /// inside a request/commit, and the consumer must not hold a read region (including a
    /// slice obtained from one) or be inside a request/commit. The producer could otherwise
    /// overwrite bytes a live shared slice points at.
    pub unsafe fn reset(&self) {
        self.shared.reset();
    }
}

impl fmt::Debug for SegmentedBipQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedBipQueue")
            .field("segment_size", &self.shared.segment_size())
            .field("segment_count", &self.shared.segment_count())
            .field("buffered_len", &self.shared.buffered_len())
            .finish()
    }
}

impl SegmentedProducer {
    /// Control handle for the queue this half writes into.
    pub fn queue(&self) -> SegmentedBipQueue {
        SegmentedBipQueue {
            shared: self.shared.clone(),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.shared.segment_count()
    }

    pub fn segment_size(&self) -> usize {
        self.shared.segment_size()
    }

    /// Ask for a contiguous span of at least `min_size` bytes per segment.
    ///
    /// The grant may be larger than requested. `None` means there is no room right now.
    pub fn request_write(&mut self, min_size: usize) -> Option<WriteGrant> {
        let epoch = self.shared.epoch();
        let grant = self.shared.request_write(min_size).map(|span| WriteGrant {
            offset: span.offset,
            len: span.len,
            epoch,
        });
        self.granted = grant;
        grant
    }

    /// Borrow the bytes of the current grant.
    ///
    /// Panics if `grant` is not the most recent grant from [`Self::request_write`].
    pub fn region(&mut self, grant: WriteGrant) -> SegmentedWriteRegion<'_> {
        assert_eq!(
            self.granted,
            Some(grant),
            "write region requested for a stale grant"
        );
        assert_eq!(
            grant.epoch,
            self.shared.epoch(),
            "write region requested for a stale grant from before a reset"
        );
        assert_eq!(grant.offset, self.shared.write_offset());
        SegmentedWriteRegion {
            shared: &self.shared,
            span: Span {
                offset: grant.offset,
                len: grant.len,
            },
        }
    }

    /// Publish `size` bytes per segment of the current grant to the consumer.
    ///
    /// Panics if `size` exceeds the most recent grant.
    pub fn commit_write(&mut self, size: usize) {
        let epoch = self.shared.epoch();
        let granted = self
            .granted
            .take()
            .filter(|g| g.epoch == epoch)
            .map_or(0, |g| g.len);
        assert!(
            size <= granted,
            "write commit of {size} bytes exceeds grant of {granted}"
        );
        if size > 0 {
            self.shared.commit_write(size);
        }
    }

    /// Forget the current grant after the queue was reset underneath this half.
    pub(crate) fn discard_grant(&mut self) {
        self.granted = None;
    }
}

impl SegmentedConsumer {
    pub fn queue(&self) -> SegmentedBipQueue {
        SegmentedBipQueue {
            shared: self.shared.clone(),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.shared.segment_count()
    }

    /// Committed bytes per segment across both spans.
    pub fn available(&self) -> usize {
        self.shared.buffered_len()
    }

    /// Find the next contiguous span of committed bytes.
    pub fn request_read(&mut self) -> Option<ReadGrant> {
        let epoch = self.shared.epoch();
        let grant = self.shared.request_read().map(|span| ReadGrant {
            offset: span.offset,
            len: span.len,
            epoch,
        });
        self.granted = grant;
        grant
    }

    /// Borrow the bytes of the current grant.
    ///
    /// Panics if `grant` is not the live grant from [`Self::request_read`].
    pub fn region(&self, grant: ReadGrant) -> SegmentedReadRegion<'_> {
        assert_eq!(
            self.granted,
            Some(grant),
            "read region requested for a stale grant"
        );
        assert_eq!(
            grant.epoch,
            self.shared.epoch(),
            "read region requested for a stale grant from before a reset"
        );
        assert_eq!(grant.offset, self.shared.read_offset());
        SegmentedReadRegion {
            shared: &self.shared,
            span: Span {
                offset: grant.offset,
                len: grant.len,
            },
        }
    }

    /// Release `size` bytes per segment back to the producer.
    ///
    /// Consecutive commits may split one grant; their total must not exceed it.
    pub fn commit_read(&mut self, size: usize) {
        if size == 0 {
            return;
        }
        let epoch = self.shared.epoch();
        let grant = self.granted.take().filter(|g| g.epoch == epoch);
        let granted = grant.map_or(0, |g| g.len);
        assert!(
            size <= granted,
            "read commit of {size} bytes exceeds grant of {granted}"
        );
        self.shared.commit_read(size);
        if let Some(g) = grant.filter(|g| g.len > size) {
            self.granted = Some(ReadGrant {
                offset: g.offset + size,
                len: g.len - size,
                epoch: g.epoch,
            });
        }
    }

    pub(crate) fn discard_grant(&mut self) {
        self.granted = None;
    }
}

impl<'a> SegmentedWriteRegion<'a> {
    /// Bytes per segment.
    pub fn len(&self) -> usize {
        self.span.len
    }

    pub fn is_empty(&self) -> bool {
        self.span.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.shared.segment_count()
    }

    pub fn segment_mut(&mut self, index: usize) -> &mut [u8] {
        let ptr = self.shared.segment_ptr(index, self.span);
        // SAFETY: the producer owns `span` in every segment until it commits, the consumer
        // never touches bytes past `write`, and `&mut self` keeps this slice unique.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.span.len) }
    }

    /// Consume the region, keeping one segment borrowed for the full grant lifetime.
    pub fn into_segment_mut(self, index: usize) -> &'a mut [u8] {
        let ptr = self.shared.segment_ptr(index, self.span);
        // SAFETY: as in `segment_mut`; the region is consumed, so no other view of it remains.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.span.len) }
    }
}

impl<'a> SegmentedReadRegion<'a> {
    pub fn len(&self) -> usize {
        self.span.len
    }

    pub fn is_empty(&self) -> bool {
        self.span.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.shared.segment_count()
    }

    pub fn segment(&self, index: usize) -> &'a [u8] {
        let ptr = self.shared.segment_ptr(index, self.span);
        // SAFETY: committed bytes in `span` are not written again until the consumer commits
        // them, which requires `&mut` access to the consumer this region borrows from.
        unsafe { std::slice::from_raw_parts(ptr, self.span.len) }
    }
}
