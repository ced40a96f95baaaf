//! Fixed-capacity circular sample store between the capture producer and the
//!  upload consumer.
//!
//! Descriptors live in a fixed slot array addressed by sequence number; the
//!  sample bytes live in a contiguous arena that is reused circularly. The
//!  producer owns the write cursor. The consumer cursor marks how far samples
//!  have been counted into the fragment under construction; everything below
//!  it has been copied out and its slots and arena bytes are reclaimable.
//!
//! While no consumer is bound the ring is a plain look-back buffer: the oldest
//!  samples are dropped silently to make room (that is the prebuffer the next
//!  session starts from). With a consumer bound, dropping a sample the
//!  consumer has not copied yet would corrupt the stream mid-fragment, so the
//!  push reports an overflow instead.

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingPushError {
    /// The oldest retained sample is still referenced by the bound consumer.
    #[error("sample ring overflow")]
    Overflow,

    /// The sample can never fit the arena, no matter what is evicted.
    #[error("sample of {len} bytes cannot fit an arena of {arena} bytes")]
    Oversized { len: usize, arena: usize },
}

/// Descriptor of one stored sample; immutable once written, owned by the ring
///  until its slot is reused.
#[derive(Debug, Clone, Copy, Default)]
struct SampleDescriptor {
    offset: usize,
    len: usize,
    timestamp: u64,
    duration: u32,
    keyframe: bool,
}

/// A sample copied out of the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedSample {
    pub seq: u64,
    pub timestamp: u64,
    pub duration: u32,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Borrowed view of the sample at the consumer cursor.
#[derive(Debug, Clone, Copy)]
pub struct SampleView<'a> {
    pub seq: u64,
    pub timestamp: u64,
    pub duration: u32,
    pub keyframe: bool,
    pub data: &'a [u8],
}

pub struct SampleRing {
    arena: Box<[u8]>,
    slots: Box<[SampleDescriptor]>,
    /// next sequence number to write (producer cursor)
    head: u64,
    /// oldest retained sequence number
    tail: u64,
    /// arena offset where the next sample starts
    write_offset: usize,
    bound: bool,
    /// first sequence number not yet copied out by the consumer
    cursor: u64,
}

impl SampleRing {
    pub fn new(slot_capacity: usize, arena_capacity: usize) -> SampleRing {
        assert!(slot_capacity >= 2, "this is a bug: ring capacity was not validated");
        SampleRing {
            arena: vec![0; arena_capacity].into_boxed_slice(),
            slots: vec![SampleDescriptor::default(); slot_capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            write_offset: 0,
            bound: false,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        (self.head - self.tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Sequence number the next pushed sample will get.
    pub fn next_seq(&self) -> u64 {
        self.head
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Bind the (single) consumer, snapping its cursor to the oldest retained
    ///  keyframe so the session starts with the full available look-back.
    pub fn bind_consumer(&mut self) {
        self.bound = true;
        let mut seq = self.tail.max(self.cursor);
        while seq < self.head && !self.slot(seq).keyframe {
            seq += 1;
        }
        self.cursor = seq;
    }

    /// Release the consumer hold; the ring reverts to dropping the oldest
    ///  samples when full.
    pub fn unbind_consumer(&mut self) {
        self.bound = false;
    }

    pub fn push(
        &mut self,
        data: &[u8],
        timestamp: u64,
        duration: u32,
        keyframe: bool,
    ) -> Result<(), RingPushError> {
        if data.len() > self.arena.len() {
            return Err(RingPushError::Oversized { len: data.len(), arena: self.arena.len() });
        }

        while self.len() == self.slots.len() {
            self.evict_oldest()?;
        }
        let offset = loop {
            match self.placement(data.len()) {
                Some(offset) => break offset,
                None => self.evict_oldest()?,
            }
        };

        self.arena[offset..offset + data.len()].copy_from_slice(data);
        let slot_index = (self.head % self.slots.len() as u64) as usize;
        self.slots[slot_index] =
            SampleDescriptor { offset, len: data.len(), timestamp, duration, keyframe };
        self.head += 1;
        self.write_offset = offset + data.len();
        Ok(())
    }

    /// View of the sample at the consumer cursor, if one is available.
    pub fn peek(&self) -> Option<SampleView<'_>> {
        if self.cursor >= self.head {
            return None;
        }
        let descriptor = self.slot(self.cursor);
        Some(SampleView {
            seq: self.cursor,
            timestamp: descriptor.timestamp,
            duration: descriptor.duration,
            keyframe: descriptor.keyframe,
            data: &self.arena[descriptor.offset..descriptor.offset + descriptor.len],
        })
    }

    /// Copy the sample at the consumer cursor out of the ring, advancing the
    ///  cursor and reclaiming every slot below it.
    pub fn consume(&mut self) -> Option<ConsumedSample> {
        if self.cursor >= self.head {
            return None;
        }
        let descriptor = *self.slot(self.cursor);
        let sample = ConsumedSample {
            seq: self.cursor,
            timestamp: descriptor.timestamp,
            duration: descriptor.duration,
            keyframe: descriptor.keyframe,
            data: Bytes::copy_from_slice(
                &self.arena[descriptor.offset..descriptor.offset + descriptor.len],
            ),
        };
        self.cursor += 1;
        self.tail = self.cursor;
        Some(sample)
    }

    fn slot(&self, seq: u64) -> &SampleDescriptor {
        &self.slots[(seq % self.slots.len() as u64) as usize]
    }

    fn evict_oldest(&mut self) -> Result<(), RingPushError> {
        debug_assert!(!self.is_empty(), "this is a bug: eviction from an empty ring");
        if self.bound && self.cursor <= self.tail {
            return Err(RingPushError::Overflow);
        }
        self.tail += 1;
        if self.cursor < self.tail {
            self.cursor = self.tail;
        }
        Ok(())
    }

    /// Arena offset where a sample of the given length fits without touching
    ///  retained bytes, or `None` if something must be evicted first.
    fn placement(&self, len: usize) -> Option<usize> {
        if self.is_empty() {
            return Some(0);
        }
        let oldest_offset = self.slot(self.tail).offset;
        if self.write_offset > oldest_offset {
            if len <= self.arena.len() - self.write_offset {
                Some(self.write_offset)
            } else if len <= oldest_offset {
                // wrap to the front, leaving a gap at the arena's end
                Some(0)
            } else {
                None
            }
        } else if self.write_offset < oldest_offset {
            if len <= oldest_offset - self.write_offset {
                Some(self.write_offset)
            } else {
                None
            }
        } else {
            None
        }
    }
}
