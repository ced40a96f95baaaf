//! The single binding point between the capture producer thread and the
//!  active upload session.
//!
//! The producer calls [`RecordingOrchestrator::push_sample`] for every
//!  captured access unit, connection or no connection. When a session is
//!  bound and the machine signals that a chunk is needed, the push path
//!  builds the next chunk right there: the init segment on a fresh
//!  connection, otherwise the next fragment's index plus as much payload as
//!  the chunk-size budget admits, deferring the remainder to later chunks.
//!
//! Every inspect-decide-mutate sequence on the shared session state happens
//!  under the per-connection lock; the orchestrator lock is always taken
//!  first, so the two lock orders cannot interleave. A ring overflow latches
//!  the `overflowed` flag, halts chunk production, and releases the ring hold
//!  so that capture continues; the controller notices through the
//!  connection's own response timeout. No connection-side failure ever stops
//!  the producer thread.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::config::UplinkConfig;
use crate::error::UplinkError;
use crate::media::h264;
use crate::media::ring::{RingPushError, SampleRing};
use crate::mux::{CodecConfig, FragmentMuxer, MediaTrackState, TrackKind};
use crate::safe_converter::SafeCast;
use crate::session::machine::{SessionState, UploadSession};
use crate::session::pool::SlotRef;
use crate::wire::messages::{
    self, ChunkMetadata, DATA_TYPE_MEDIA_FRAGMENT, DATA_TYPE_MEDIA_INITIALIZATION,
};

/// Emission progress of the data item currently on the wire.
enum ItemState {
    /// Nothing sent yet; the first chunk of the connection carries the init
    ///  segment.
    NeedInit,
    InitSending { data: Bytes, offset: usize },
    /// Between items; the next completed fragment starts the next one.
    Steady,
    /// A fragment's payload is partially emitted (the muxer carries the
    ///  resumption state).
    FragmentSending,
}

struct BoundConnection {
    slot: SlotRef,
    session: Arc<Mutex<UploadSession>>,
    /// Wakes the reactor once a chunk has been queued outbound.
    notify: Arc<Notify>,
    muxer: FragmentMuxer,
    item: ItemState,
}

struct Inner {
    tracks: Vec<MediaTrackState>,
    /// One pending sample per track: durations are derived from successive
    ///  capture timestamps, so each sample enters the ring when its successor
    ///  arrives.
    pending: Vec<Option<PendingSample>>,
    last_duration: Vec<u32>,
    bound: Option<BoundConnection>,
    max_chunk_size: usize,
}

struct PendingSample {
    data: Bytes,
    timestamp: u64,
    keyframe: bool,
}

pub struct RecordingOrchestrator {
    inner: Mutex<Inner>,
}

impl RecordingOrchestrator {
    pub fn new(config: &UplinkConfig) -> RecordingOrchestrator {
        let mut tracks = vec![MediaTrackState::new(
            1,
            TrackKind::Video,
            config.video.timescale,
            CodecConfig::H264 {
                width: config.video.width,
                height: config.video.height,
                sps: None,
                pps: None,
            },
            SampleRing::new(config.video.ring_slots, config.video.ring_bytes),
        )];
        if let Some(audio) = &config.audio {
            tracks.push(MediaTrackState::new(
                2,
                TrackKind::Audio,
                audio.timescale,
                CodecConfig::Aac {
                    sample_rate: audio.sample_rate,
                    channels: audio.channels,
                    audio_specific_config: Bytes::from(audio.audio_specific_config.clone()),
                },
                SampleRing::new(audio.ring_slots, audio.ring_bytes),
            ));
        }
        let track_count = tracks.len();
        RecordingOrchestrator {
            inner: Mutex::new(Inner {
                tracks,
                pending: (0..track_count).map(|_| None).collect(),
                last_duration: vec![0; track_count],
                bound: None,
                max_chunk_size: config.max_chunk_size,
            }),
        }
    }

    /// Capture-side entry point. Parameter-set NAL units are recognized and
    ///  retained out-of-band; everything else lands in the track's ring.
    ///  Never fails towards the caller: the capture thread must keep running
    ///  whatever happens on the connection side.
    pub fn push_sample(&self, track: TrackKind, data: &[u8], timestamp: u64, keyframe: bool) {
        let mut inner = self.inner.lock().unwrap();
        let Some(track_index) = inner.tracks.iter().position(|t| t.kind == track) else {
            warn!("sample for unconfigured {:?} track dropped", track);
            return;
        };

        if track == TrackKind::Video && self.capture_parameter_set(&mut inner, track_index, data) {
            return;
        }

        self.enqueue_sample(&mut inner, track_index, data, timestamp, keyframe);
        self.ingest_and_build(&mut inner);
    }

    /// Bind a session; only one can be bound, later sessions stall by design.
    pub fn bind(
        &self,
        slot: SlotRef,
        session: Arc<Mutex<UploadSession>>,
        notify: Arc<Notify>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.bound.is_some() {
            debug!("orchestrator already bound, session in slot {} stalls", slot.index);
            return false;
        }
        for track in &mut inner.tracks {
            track.base_decode_time = 0;
            track.ring.bind_consumer();
        }
        inner.bound = Some(BoundConnection {
            slot,
            session,
            notify,
            muxer: FragmentMuxer::new(),
            item: ItemState::NeedInit,
        });
        debug!("bound connection slot {} to the recording orchestrator", slot.index);
        // the prebuffer may already hold complete fragments
        self.ingest_and_build(&mut inner);
        true
    }

    /// Unbind if (and only if) the given slot is the bound one; stale slot
    ///  references from a released connection are ignored.
    pub fn unbind(&self, slot: SlotRef) {
        let mut inner = self.inner.lock().unwrap();
        if inner.bound.as_ref().map(|b| b.slot) == Some(slot) {
            inner.bound = None;
            for track in &mut inner.tracks {
                track.ring.unbind_consumer();
            }
            debug!("unbound connection slot {} from the recording orchestrator", slot.index);
        }
    }

    pub fn is_bound(&self) -> bool {
        self.inner.lock().unwrap().bound.is_some()
    }

    /// True if the captured parameter set was consumed out-of-band.
    fn capture_parameter_set(&self, inner: &mut Inner, track_index: usize, data: &[u8]) -> bool {
        let Some(nal_type) = h264::leading_nal_type(data) else {
            return true; // empty access unit, nothing to store
        };
        if !nal_type.is_parameter_set() {
            return false;
        }
        let payload = Bytes::copy_from_slice(h264::strip_start_code(data));
        if let CodecConfig::H264 { sps, pps, .. } = &mut inner.tracks[track_index].codec {
            match nal_type {
                h264::NalUnitType::Sps => {
                    trace!("captured SPS ({} bytes)", payload.len());
                    *sps = Some(payload);
                }
                h264::NalUnitType::Pps => {
                    trace!("captured PPS ({} bytes)", payload.len());
                    *pps = Some(payload);
                }
                _ => {}
            }
        }
        true
    }

    fn enqueue_sample(
        &self,
        inner: &mut Inner,
        track_index: usize,
        data: &[u8],
        timestamp: u64,
        keyframe: bool,
    ) {
        let next = PendingSample { data: Bytes::copy_from_slice(data), timestamp, keyframe };
        let Some(previous) = inner.pending[track_index].replace(next) else {
            return;
        };

        let duration = if timestamp > previous.timestamp {
            (timestamp - previous.timestamp).min(u32::MAX.safe_cast()) as u32
        } else {
            warn!("non-monotonic capture timestamp, reusing the previous duration");
            inner.last_duration[track_index]
        };
        inner.last_duration[track_index] = duration;

        let result = inner.tracks[track_index].ring.push(
            &previous.data,
            previous.timestamp,
            duration,
            previous.keyframe,
        );
        match result {
            Ok(()) => {}
            Err(RingPushError::Overflow) => self.latch_overflow(inner),
            Err(e @ RingPushError::Oversized { .. }) => {
                warn!("dropping sample: {}", e);
            }
        }
    }

    /// Overflow: halt chunk production for the bound connection and release
    ///  the ring hold so capture keeps accumulating for a future session. The
    ///  connection is left to be reclaimed by its own response timeout; no
    ///  explicit error frame is sent.
    fn latch_overflow(&self, inner: &mut Inner) {
        warn!("sample ring overflow, halting chunk production: {}", UplinkError::RingOverflow);
        if let Some(bound) = &inner.bound {
            let mut session = bound.session.lock().unwrap();
            session.chunk.overflowed = true;
        }
        for track in &mut inner.tracks {
            track.ring.unbind_consumer();
        }
    }

    /// Advance the muxer over the freshly pushed samples and, when the bound
    ///  machine asks for one, build and hand over the next chunk.
    fn ingest_and_build(&self, inner: &mut Inner) {
        let Inner { tracks, bound, max_chunk_size, .. } = inner;
        let Some(bound) = bound.as_mut() else { return };

        let mut session = bound.session.lock().unwrap();
        if session.chunk.overflowed {
            return;
        }
        bound.muxer.ingest(tracks);

        if session.state() != SessionState::GetChunk || !session.chunk.chunk_needed {
            return;
        }

        let Some(chunk) = next_chunk(
            &mut bound.item,
            &mut bound.muxer,
            tracks,
            *max_chunk_size,
            &mut session,
        ) else {
            return;
        };

        let payload = messages::encode_data_event(
            session.chunk.stream_id,
            chunk.end_of_stream,
            &chunk.metadata,
            &chunk.data,
        );
        match session.submit_chunk(&payload, chunk.end_of_stream) {
            Ok(()) => {
                trace!(
                    "chunk queued: item {} chunk {} ({} bytes{})",
                    chunk.metadata.data_sequence_number,
                    chunk.metadata.data_chunk_sequence_number,
                    chunk.data.len(),
                    if chunk.metadata.is_last_data_chunk { ", last" } else { "" }
                );
                bound.notify.notify_one();
            }
            Err(e) => warn!("chunk submission failed: {}", e),
        }
    }
}

struct BuiltChunk {
    metadata: ChunkMetadata,
    data: Bytes,
    end_of_stream: bool,
}

/// Compute the next chunk of the current (or next) data item, updating the
///  item-progress state and the session's `ChunkContext`.
fn next_chunk(
    item: &mut ItemState,
    muxer: &mut FragmentMuxer,
    tracks: &mut [MediaTrackState],
    max_chunk_size: usize,
    session: &mut UploadSession,
) -> Option<BuiltChunk> {
    match item {
        ItemState::NeedInit => {
            let init = muxer.write_init_segment(tracks)?;
            session.chunk.data_sequence_number = 1;
            session.chunk.data_chunk_sequence_number = 1;
            session.chunk.data_total_size = init.len() as u64;
            session.chunk.sent_data_size = 0;
            *item = ItemState::InitSending { data: init, offset: 0 };
            next_chunk(item, muxer, tracks, max_chunk_size, session)
        }
        ItemState::InitSending { data, offset } => {
            let end = (*offset + max_chunk_size).min(data.len());
            let chunk = data.slice(*offset..end);
            let first = *offset == 0;
            let last = end == data.len();
            if !first {
                session.chunk.data_chunk_sequence_number += 1;
            }
            session.chunk.sent_data_size += chunk.len() as u64;
            session.chunk.is_last_data_chunk = last;
            let metadata = ChunkMetadata {
                data_total_size: first.then(|| data.len() as i64),
                data_type: DATA_TYPE_MEDIA_INITIALIZATION,
                data_sequence_number: session.chunk.data_sequence_number,
                is_last_data_chunk: last,
                data_chunk_sequence_number: session.chunk.data_chunk_sequence_number,
            };
            *offset = end;
            if last {
                *item = ItemState::Steady;
            }
            // the init segment is never the terminal item
            Some(BuiltChunk { metadata, data: chunk, end_of_stream: false })
        }
        ItemState::Steady => {
            let index = muxer.write_fragment_index()?;
            let budget = max_chunk_size.saturating_sub(index.header.len());
            let (payload, done) = muxer.write_payload(budget);

            let mut data = bytes::BytesMut::with_capacity(index.header.len() + payload.len());
            data.extend_from_slice(&index.header);
            data.extend_from_slice(&payload);
            let data = data.freeze();

            session.chunk.data_sequence_number += 1;
            session.chunk.data_chunk_sequence_number = 1;
            session.chunk.data_total_size = index.total_size;
            session.chunk.sent_data_size = data.len() as u64;
            session.chunk.is_last_data_chunk = done;
            let end_of_stream = done && session.chunk.end_of_stream_requested;
            let metadata = ChunkMetadata {
                data_total_size: Some(index.total_size as i64),
                data_type: DATA_TYPE_MEDIA_FRAGMENT,
                data_sequence_number: session.chunk.data_sequence_number,
                is_last_data_chunk: done,
                data_chunk_sequence_number: session.chunk.data_chunk_sequence_number,
            };
            *item = if done { ItemState::Steady } else { ItemState::FragmentSending };
            Some(BuiltChunk { metadata, data, end_of_stream })
        }
        ItemState::FragmentSending => {
            let (payload, done) = muxer.write_payload(max_chunk_size);
            if payload.is_empty() && !done {
                // budget smaller than the next sample; nothing to send yet
                return None;
            }
            session.chunk.data_chunk_sequence_number += 1;
            session.chunk.sent_data_size += payload.len() as u64;
            session.chunk.is_last_data_chunk = done;
            debug_assert!(session.chunk.sent_data_size <= session.chunk.data_total_size);
            let end_of_stream = done && session.chunk.end_of_stream_requested;
            let metadata = ChunkMetadata {
                data_total_size: None,
                data_type: DATA_TYPE_MEDIA_FRAGMENT,
                data_sequence_number: session.chunk.data_sequence_number,
                is_last_data_chunk: done,
                data_chunk_sequence_number: session.chunk.data_chunk_sequence_number,
            };
            if done {
                *item = ItemState::Steady;
            }
            Some(BuiltChunk { metadata, data: payload, end_of_stream })
        }
    }
}
