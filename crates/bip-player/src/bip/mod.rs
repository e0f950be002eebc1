//! Lock-free single-producer/single-consumer "bip" byte queues.
//!
//! A bip buffer hands out *contiguous* spans on both sides, so a producer can decode straight
//! into queue memory and a consumer can point an output device straight at it. The price is
//! that the tail of the buffer may be skipped when a request does not fit there: the producer
//! wraps to offset 0 and records where valid data ends (the watermark).
//!
//! Protocol, per side:
//! - `request_*` returns a grant (or `None` when there is nothing to hand out),
//! - `region(grant)` borrows the granted bytes,
//! - `commit_*` publishes or releases some prefix of the grant.
//!
//! One byte is never used, so `read == write` always means empty and at most
//! `capacity - 1` bytes per segment are outstanding.
//!
//! [`BipQueue`] is the single-buffer case of [`SegmentedBipQueue`].

mod queue;
mod segmented;
mod shared;

pub use queue::{BipConsumer, BipProducer, BipQueue};
pub use segmented::{
    ReadGrant, SegmentedBipQueue, SegmentedConsumer, SegmentedProducer, SegmentedReadRegion,
    SegmentedWriteRegion, WriteGrant,
};
