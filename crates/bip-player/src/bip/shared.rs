//! Offset bookkeeping shared by the producer and consumer halves.
//!
//! Every segment of a queue uses the same three offsets:
//! - `read` (R): owned by the consumer, next byte to read.
//! - `write` (W): owned by the producer, next byte to write.
//! - `watermark` (WW): end of valid data in the tail region once the producer has wrapped.
//!
//! The producer always publishes `watermark` before `write`, and the consumer always loads
//! `write` before `watermark`, so a consumer that observes a wrapped `write` also observes the
//! watermark that goes with it.
//!
//! `epoch` counts resets. Grants remember the epoch they were issued in, so a grant that
//! outlived a reset is rejected even when its offsets happen to match the rewound queue.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A contiguous byte range inside each segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Span {
    pub offset: usize,
    pub len: usize,
}

pub(crate) struct BipShared {
    storage: Box<[UnsafeCell<u8>]>,
    segment_size: usize,
    segment_count: usize,
    read: AtomicUsize,
    write: AtomicUsize,
    watermark: AtomicUsize,
    epoch: AtomicU64,
}

// SAFETY: the byte storage is only reached through `segment_ptr`, and the producer/consumer
// halves only form slices over spans the offset protocol hands to them exclusively.
unsafe impl Sync for BipShared {}

impl BipShared {
    pub fn new(segment_size: usize, segment_count: usize) -> Self {
        assert!(segment_size >= 2, "bip segment must hold at least 2 bytes");
        assert!(segment_count >= 1, "bip queue needs at least one segment");
        let total = segment_size
            .checked_mul(segment_count)
            .expect("bip queue size overflows usize");
        let storage = (0..total).map(|_| UnsafeCell::new(0u8)).collect();
        Self {
            storage,
            segment_size,
            segment_count,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            watermark: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Consumer side: find the next readable span, wrapping `read` if the tail is drained.
    pub fn request_read(&self) -> Option<Span> {
        let write = self.write.load(Ordering::Acquire);
        let watermark = self.watermark.load(Ordering::Acquire);
        let mut read = self.read.load(Ordering::Relaxed);

        if write != watermark && read == watermark {
            read = 0;
            self.read.store(0, Ordering::Release);
        }

        if read < write {
            Some(Span {
                offset: read,
                len: write - read,
            })
        } else if read > write {
            assert!(
                read <= watermark,
                "bip read offset {read} past watermark {watermark}"
            );
            (read < watermark).then(|| Span {
                offset: read,
                len: watermark - read,
            })
        } else {
            None
        }
    }

    pub fn commit_read(&self, len: usize) {
        let read = self.read.load(Ordering::Relaxed);
        self.read.store(read + len, Ordering::Release);
    }

    /// Producer side: find a writable span of at least `min_len` bytes.
    ///
    /// One byte is always held back so that `read == write` keeps meaning "empty".
    pub fn request_write(&self, min_len: usize) -> Option<Span> {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Relaxed);

        let span = if read <= write {
            self.watermark.store(write, Ordering::Release);
            let slack = usize::from(read == 0);
            let tail = (self.segment_size - write).saturating_sub(slack);
            if tail >= min_len {
                Span {
                    offset: write,
                    len: tail,
                }
            } else if read > min_len {
                self.write.store(0, Ordering::Release);
                Span {
                    offset: 0,
                    len: read - 1,
                }
            } else {
                return None;
            }
        } else if read - write > min_len {
            Span {
                offset: write,
                len: read - write - 1,
            }
        } else {
            return None;
        };

        (span.len > 0).then_some(span)
    }

    pub fn commit_write(&self, len: usize) {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Relaxed);
        let next = write + len;
        assert!(
            next <= self.segment_size,
            "bip write commit past segment end ({next} > {})",
            self.segment_size
        );
        if read <= write {
            self.watermark.store(next, Ordering::Release);
        }
        self.write.store(next, Ordering::Release);
    }

    /// Rewind all offsets and start a new epoch. Both halves must be idle.
    pub fn reset(&self) {
        self.read.store(0, Ordering::SeqCst);
        self.write.store(0, Ordering::SeqCst);
        self.watermark.store(0, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Bytes per segment currently committed and not yet consumed (best effort).
    pub fn buffered_len(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let watermark = self.watermark.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        if read <= write {
            write - read
        } else {
            watermark.saturating_sub(read) + write
        }
    }

    pub fn read_offset(&self) -> usize {
        self.read.load(Ordering::Relaxed)
    }

    pub fn write_offset(&self) -> usize {
        self.write.load(Ordering::Relaxed)
    }

    /// Raw pointer to `offset` within `segment`, after bounds checking `len` bytes from there.
    pub fn segment_ptr(&self, segment: usize, span: Span) -> *mut u8 {
        assert!(
            segment < self.segment_count,
            "segment {segment} out of range ({} segments)",
            self.segment_count
        );
        assert!(
            span.offset + span.len <= self.segment_size,
            "span {}..{} exceeds segment size {}",
            span.offset,
            span.offset + span.len,
            self.segment_size
        );
        let index = segment * self.segment_size + span.offset;
        // SAFETY: `index` is at most `storage.len()` thanks to the assertions above, so the
        // resulting pointer is in bounds or one past the end.
        unsafe { UnsafeCell::raw_get(self.storage.as_ptr().add(index)) }
    }
}
