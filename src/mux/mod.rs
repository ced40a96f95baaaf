//! Fragmented-container muxer.
//!
//! The one-time init segment (file-type box + movie box with per-track codec
//!  configuration and a movie-extends box) is followed by self-contained
//!  fragments, each a movie-fragment box immediately followed by a media-data
//!  box. Fragments begin only at keyframe-bearing video samples and end just
//!  before the next keyframe, so every fragment is independently decodable;
//!  audio samples are grouped into the video fragment's timestamp window.
//!
//! The muxer walks the sample rings incrementally: samples counted into the
//!  open fragment's index are copied out of the ring right away (freeing their
//!  slots for the producer), and payload emission is resumable under a
//!  caller-supplied byte budget, never splitting a sample. The concatenation
//!  of any sequence of bounded payload calls is byte-identical to one
//!  unbounded call.

pub mod boxes;

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::media::ring::{ConsumedSample, SampleRing};
use crate::safe_converter::PrecheckedCast;
use boxes::BoxWriter;

pub const MOVIE_TIMESCALE: u32 = 1000;

/// Completed fragments queued for emission before the walk stops consuming
///  ring samples. With the walk stalled, a stalling connection shows up as
///  ring pressure at the producer instead of unbounded staging memory.
const MAX_READY_FRAGMENTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// Codec configuration of one elementary stream. Video parameter sets are
///  captured on the fly from the live stream; the audio decoder configuration
///  is supplied when the track is set up.
pub enum CodecConfig {
    H264 { width: u16, height: u16, sps: Option<Bytes>, pps: Option<Bytes> },
    Aac { sample_rate: u32, channels: u16, audio_specific_config: Bytes },
}

impl CodecConfig {
    /// Whether the decoder configuration record can be built yet.
    pub fn is_ready(&self) -> bool {
        match self {
            CodecConfig::H264 { sps, pps, .. } => sps.is_some() && pps.is_some(),
            CodecConfig::Aac { .. } => true,
        }
    }
}

/// Per-elementary-stream state. Lives for the process lifetime; only the
///  owning track's restart resets it.
pub struct MediaTrackState {
    pub track_id: u32,
    pub kind: TrackKind,
    /// Ticks per second of this track's timestamps and durations.
    pub timescale: u32,
    pub codec: CodecConfig,
    /// Decode time of the next fragment's first sample, in track ticks.
    pub base_decode_time: u64,
    pub ring: SampleRing,
}

impl MediaTrackState {
    pub fn new(
        track_id: u32,
        kind: TrackKind,
        timescale: u32,
        codec: CodecConfig,
        ring: SampleRing,
    ) -> MediaTrackState {
        MediaTrackState { track_id, kind, timescale, codec, base_decode_time: 0, ring }
    }
}

struct BuildingFragment {
    start_seq: u64,
    start_timestamp: u64,
    video_samples: Vec<ConsumedSample>,
}

struct ReadyTrack {
    track_id: u32,
    base_decode_time: u64,
    samples: Vec<ConsumedSample>,
}

struct ReadyFragment {
    sequence: u32,
    tracks: Vec<ReadyTrack>,
}

/// Resumption state of the payload writer: which staged samples have already
///  been copied into chunk payloads.
struct Emission {
    payloads: Vec<Bytes>,
    next: usize,
}

/// The emitted index part of one fragment (movie-fragment box plus the
///  media-data box header), with the size bookkeeping the chunk metadata
///  needs.
pub struct FragmentIndex {
    pub sequence: u32,
    pub header: Bytes,
    /// header + payload
    pub total_size: u64,
    pub payload_size: u64,
}

pub struct FragmentMuxer {
    /// Sequence number the next completed fragment gets (movie-fragment
    ///  header), starting at 1.
    fragment_sequence: u32,
    building: Option<BuildingFragment>,
    ready: VecDeque<ReadyFragment>,
    emitting: Option<Emission>,
}

impl FragmentMuxer {
    pub fn new() -> FragmentMuxer {
        FragmentMuxer {
            fragment_sequence: 1,
            building: None,
            ready: VecDeque::new(),
            emitting: None,
        }
    }

    /// Walk the rings as far as the available samples allow. Samples counted
    ///  into the open fragment are copied out of the ring immediately, so the
    ///  producer's slots free up even while the fragment is still open. The
    ///  first track must be the video track; its keyframes define the
    ///  fragment boundaries.
    pub fn ingest(&mut self, tracks: &mut [MediaTrackState]) {
        debug_assert!(matches!(tracks.first().map(|t| t.kind), Some(TrackKind::Video)));

        loop {
            if self.ready.len() >= MAX_READY_FRAGMENTS {
                break;
            }
            let Some(view) = tracks[0].ring.peek() else { break };
            let (seq, timestamp, keyframe) = (view.seq, view.timestamp, view.keyframe);

            if self.building.is_none() {
                let sample = tracks[0].ring.consume().expect("this is a bug: peeked sample vanished");
                if keyframe {
                    trace!("fragment opens at sample {} (t={})", seq, timestamp);
                    self.building = Some(BuildingFragment {
                        start_seq: seq,
                        start_timestamp: timestamp,
                        video_samples: vec![sample],
                    });
                } else {
                    // not usable before the first keyframe
                    trace!("dropping pre-keyframe sample {}", seq);
                }
            } else if keyframe {
                self.finish_building(tracks, timestamp);
                // the loop continues and this keyframe opens the next fragment
            } else {
                let sample = tracks[0].ring.consume().expect("this is a bug: peeked sample vanished");
                self.building
                    .as_mut()
                    .expect("this is a bug: fragment closed mid-iteration")
                    .video_samples
                    .push(sample);
            }
        }
    }

    /// Close the open fragment just before the keyframe at
    ///  `boundary_timestamp` and queue it for emission.
    fn finish_building(&mut self, tracks: &mut [MediaTrackState], boundary_timestamp: u64) {
        let building = self.building.take().expect("this is a bug: no fragment open");

        let mut ready_tracks = Vec::with_capacity(tracks.len());
        let video_duration: u64 =
            building.video_samples.iter().map(|s| s.duration as u64).sum();
        ready_tracks.push(ReadyTrack {
            track_id: tracks[0].track_id,
            base_decode_time: tracks[0].base_decode_time,
            samples: building.video_samples,
        });
        let video_timescale = tracks[0].timescale;
        tracks[0].base_decode_time += video_duration;

        for track in &mut tracks[1..] {
            let boundary = rescale(boundary_timestamp, video_timescale, track.timescale);
            let mut samples = Vec::new();
            while let Some(view) = track.ring.peek() {
                if view.timestamp >= boundary {
                    break;
                }
                samples.push(track.ring.consume().expect("this is a bug: peeked sample vanished"));
            }
            let duration: u64 = samples.iter().map(|s| s.duration as u64).sum();
            ready_tracks.push(ReadyTrack {
                track_id: track.track_id,
                base_decode_time: track.base_decode_time,
                samples,
            });
            track.base_decode_time += duration;
        }

        let sequence = self.fragment_sequence;
        self.fragment_sequence += 1;
        debug!(
            "fragment {} complete: samples {}..{} ({} queued)",
            sequence,
            building.start_seq,
            building.start_seq + ready_tracks[0].samples.len() as u64,
            self.ready.len() + 1
        );
        self.ready.push_back(ReadyFragment { sequence, tracks: ready_tracks });
    }

    /// Whether a completed fragment is queued for emission.
    pub fn has_ready_fragment(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Whether a fragment's payload emission is still in progress.
    pub fn item_in_progress(&self) -> bool {
        self.emitting.is_some()
    }

    /// One-time container header: file-type box plus the movie box with
    ///  per-track codec configuration and the movie-extends defaults.
    ///  `None` until every track's decoder configuration has been captured.
    ///  Total duration is not known in advance, so every duration field
    ///  carries the unknown placeholder.
    pub fn write_init_segment(&self, tracks: &[MediaTrackState]) -> Option<Bytes> {
        if !tracks.iter().all(|t| t.codec.is_ready()) {
            return None;
        }

        let mut w = BoxWriter::with_capacity(1024);

        let ftyp = w.begin_box(b"ftyp");
        w.put_slice(b"iso5");
        w.put_u32(0);
        w.put_slice(b"iso5");
        w.put_slice(b"iso6");
        w.put_slice(b"mp41");
        w.end_box(ftyp);

        let moov = w.begin_box(b"moov");
        let next_track_id = tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1;
        write_mvhd(&mut w, next_track_id);
        for track in tracks {
            write_trak(&mut w, track);
        }
        let mvex = w.begin_box(b"mvex");
        for track in tracks {
            let trex = w.begin_full_box(b"trex", 0, 0);
            w.put_u32(track.track_id);
            w.put_u32(1); // default sample description index
            w.put_u32(0); // default sample duration
            w.put_u32(0); // default sample size
            w.put_u32(0); // default sample flags
            w.end_box(trex);
        }
        w.end_box(mvex);
        w.end_box(moov);

        Some(w.finish())
    }

    /// Emit the index part of the oldest completed fragment: the
    ///  movie-fragment box (fragment header plus one track-fragment box per
    ///  non-empty track) and the media-data box header. Run data offsets are
    ///  written as placeholders on the first pass and back-patched once the
    ///  index length is known. Returns `None` while the previous item's
    ///  payload is still being emitted or no fragment is complete.
    pub fn write_fragment_index(&mut self) -> Option<FragmentIndex> {
        if self.emitting.is_some() {
            return None;
        }
        let fragment = self.ready.pop_front()?;

        let mut w = BoxWriter::with_capacity(4096);
        let moof = w.begin_box(b"moof");
        let mfhd = w.begin_full_box(b"mfhd", 0, 0);
        w.put_u32(fragment.sequence);
        w.end_box(mfhd);

        // first pass: write the runs with placeholder offsets, remembering
        // where they live and how much payload precedes each track
        let mut offset_fields: Vec<(usize, u64)> = Vec::new();
        let mut preceding_payload: u64 = 0;
        for track in &fragment.tracks {
            if track.samples.is_empty() {
                continue;
            }
            let traf = w.begin_box(b"traf");
            let tfhd = w.begin_full_box(b"tfhd", 0, 0x0002_0000); // default-base-is-moof
            w.put_u32(track.track_id);
            w.end_box(tfhd);
            let tfdt = w.begin_full_box(b"tfdt", 1, 0);
            w.put_u64(track.base_decode_time);
            w.end_box(tfdt);

            // data-offset + sample-duration + sample-size + sample-flags
            let trun = w.begin_full_box(b"trun", 0, 0x000001 | 0x000100 | 0x000200 | 0x000400);
            w.put_u32(track.samples.len().prechecked_cast());
            offset_fields.push((w.position(), preceding_payload));
            w.put_u32(0);
            for sample in &track.samples {
                w.put_u32(sample.duration);
                w.put_u32(sample.data.len().prechecked_cast());
                w.put_u32(if sample.keyframe { 0x0200_0000 } else { 0x0101_0000 });
            }
            w.end_box(trun);
            w.end_box(traf);

            preceding_payload += track.samples.iter().map(|s| s.data.len() as u64).sum::<u64>();
        }
        w.end_box(moof);

        // second pass: true offsets, now that the index length is known
        let moof_len = w.position() as u64;
        let payload_size = preceding_payload;
        w.put_u32((8 + payload_size).prechecked_cast());
        w.put_slice(b"mdat");
        for (position, preceding) in offset_fields {
            w.patch_u32_at(position, (moof_len + 8 + preceding).prechecked_cast());
        }

        let payloads: Vec<Bytes> = fragment
            .tracks
            .iter()
            .flat_map(|t| t.samples.iter().map(|s| s.data.clone()))
            .collect();
        self.emitting = Some(Emission { payloads, next: 0 });

        let header = w.finish();
        Some(FragmentIndex {
            sequence: fragment.sequence,
            total_size: header.len() as u64 + payload_size,
            payload_size,
            header,
        })
    }

    /// Copy staged samples into an output buffer, stopping at the byte budget
    ///  or the end of the fragment. Never copies a partial sample; a call
    ///  whose budget does not cover the next sample makes no progress.
    ///  `done` reports that the fragment's payload is fully emitted.
    pub fn write_payload(&mut self, max_bytes: usize) -> (Bytes, bool) {
        let Some(emission) = &mut self.emitting else {
            return (Bytes::new(), true);
        };

        let mut out = BytesMut::new();
        while emission.next < emission.payloads.len() {
            let sample = &emission.payloads[emission.next];
            if out.len() + sample.len() > max_bytes {
                break;
            }
            out.put_slice(sample);
            emission.next += 1;
        }

        let done = emission.next == emission.payloads.len();
        if done {
            self.emitting = None;
        }
        (out.freeze(), done)
    }
}

fn rescale(value: u64, from: u32, to: u32) -> u64 {
    (value as u128 * to as u128 / from as u128) as u64
}

fn write_mvhd(w: &mut BoxWriter, next_track_id: u32) {
    let mvhd = w.begin_full_box(b"mvhd", 0, 0);
    w.put_u32(0); // creation time
    w.put_u32(0); // modification time
    w.put_u32(MOVIE_TIMESCALE);
    w.put_u32(0); // duration unknown up front
    w.put_u32(0x0001_0000); // rate 1.0
    w.put_u16(0x0100); // volume 1.0
    w.put_zeros(10);
    write_unity_matrix(w);
    w.put_zeros(24); // pre-defined
    w.put_u32(next_track_id);
    w.end_box(mvhd);
}

fn write_trak(w: &mut BoxWriter, track: &MediaTrackState) {
    let trak = w.begin_box(b"trak");

    let tkhd = w.begin_full_box(b"tkhd", 0, 0x000003); // enabled + in movie
    w.put_u32(0); // creation time
    w.put_u32(0); // modification time
    w.put_u32(track.track_id);
    w.put_u32(0); // reserved
    w.put_u32(0); // duration unknown
    w.put_zeros(8);
    w.put_u16(0); // layer
    w.put_u16(0); // alternate group
    w.put_u16(if matches!(track.kind, TrackKind::Audio) { 0x0100 } else { 0 });
    w.put_u16(0); // reserved
    write_unity_matrix(w);
    match &track.codec {
        CodecConfig::H264 { width, height, .. } => {
            w.put_u32((*width as u32) << 16);
            w.put_u32((*height as u32) << 16);
        }
        CodecConfig::Aac { .. } => {
            w.put_u32(0);
            w.put_u32(0);
        }
    }
    w.end_box(tkhd);

    let mdia = w.begin_box(b"mdia");
    let mdhd = w.begin_full_box(b"mdhd", 0, 0);
    w.put_u32(0); // creation time
    w.put_u32(0); // modification time
    w.put_u32(track.timescale);
    w.put_u32(0); // duration unknown
    w.put_u16(0x55C4); // language 'und'
    w.put_u16(0); // quality
    w.end_box(mdhd);

    let hdlr = w.begin_full_box(b"hdlr", 0, 0);
    w.put_u32(0); // pre-defined
    match track.kind {
        TrackKind::Video => {
            w.put_slice(b"vide");
            w.put_zeros(12);
            w.put_slice(b"VideoHandler\0");
        }
        TrackKind::Audio => {
            w.put_slice(b"soun");
            w.put_zeros(12);
            w.put_slice(b"SoundHandler\0");
        }
    }
    w.end_box(hdlr);

    let minf = w.begin_box(b"minf");
    match track.kind {
        TrackKind::Video => {
            let vmhd = w.begin_full_box(b"vmhd", 0, 1);
            w.put_zeros(8); // graphics mode + op color
            w.end_box(vmhd);
        }
        TrackKind::Audio => {
            let smhd = w.begin_full_box(b"smhd", 0, 0);
            w.put_u16(0); // balance
            w.put_u16(0); // reserved
            w.end_box(smhd);
        }
    }

    let dinf = w.begin_box(b"dinf");
    let dref = w.begin_full_box(b"dref", 0, 0);
    w.put_u32(1); // entry count
    let url = w.begin_full_box(b"url ", 0, 1); // self-contained
    w.end_box(url);
    w.end_box(dref);
    w.end_box(dinf);

    let stbl = w.begin_box(b"stbl");
    let stsd = w.begin_full_box(b"stsd", 0, 0);
    w.put_u32(1); // entry count
    match &track.codec {
        CodecConfig::H264 { width, height, sps, pps } => {
            let sps = sps.as_ref().expect("this is a bug: readiness was checked");
            let pps = pps.as_ref().expect("this is a bug: readiness was checked");
            write_avc1(w, *width, *height, sps, pps);
        }
        CodecConfig::Aac { sample_rate, channels, audio_specific_config } => {
            write_mp4a(w, track.track_id, *sample_rate, *channels, audio_specific_config);
        }
    }
    w.end_box(stsd);

    // sample tables stay empty; the actual run data lives in the fragments
    for fourcc in [b"stts", b"stsc"] {
        let empty = w.begin_full_box(fourcc, 0, 0);
        w.put_u32(0);
        w.end_box(empty);
    }
    let stsz = w.begin_full_box(b"stsz", 0, 0);
    w.put_u32(0); // sample size (variable)
    w.put_u32(0); // sample count
    w.end_box(stsz);
    let stco = w.begin_full_box(b"stco", 0, 0);
    w.put_u32(0);
    w.end_box(stco);
    w.end_box(stbl);

    w.end_box(minf);
    w.end_box(mdia);
    w.end_box(trak);
}

fn write_avc1(w: &mut BoxWriter, width: u16, height: u16, sps: &Bytes, pps: &Bytes) {
    let avc1 = w.begin_box(b"avc1");
    w.put_zeros(6); // reserved
    w.put_u16(1); // data reference index
    w.put_u16(0); // pre-defined
    w.put_u16(0); // reserved
    w.put_zeros(12); // pre-defined
    w.put_u16(width);
    w.put_u16(height);
    w.put_u32(0x0048_0000); // horizontal resolution, 72 dpi
    w.put_u32(0x0048_0000); // vertical resolution, 72 dpi
    w.put_u32(0); // reserved
    w.put_u16(1); // frame count
    w.put_zeros(32); // compressor name
    w.put_u16(0x0018); // depth
    w.put_u16(0xFFFF); // pre-defined

    let avcc = w.begin_box(b"avcC");
    w.put_u8(1); // configuration version
    w.put_u8(sps.get(1).copied().unwrap_or(0x42)); // profile
    w.put_u8(sps.get(2).copied().unwrap_or(0x00)); // profile compatibility
    w.put_u8(sps.get(3).copied().unwrap_or(0x1E)); // level
    w.put_u8(0xFF); // 4-byte NAL length prefixes
    w.put_u8(0xE1); // one SPS
    w.put_u16(sps.len().prechecked_cast());
    w.put_slice(sps);
    w.put_u8(1); // one PPS
    w.put_u16(pps.len().prechecked_cast());
    w.put_slice(pps);
    w.end_box(avcc);

    w.end_box(avc1);
}

fn write_mp4a(w: &mut BoxWriter, track_id: u32, sample_rate: u32, channels: u16, asc: &Bytes) {
    // one-byte descriptor sizes below only hold for short configuration records
    assert!(asc.len() <= 64, "this is a bug: AudioSpecificConfig length was not validated");

    let mp4a = w.begin_box(b"mp4a");
    w.put_zeros(6); // reserved
    w.put_u16(1); // data reference index
    w.put_u16(0); // version
    w.put_u16(0); // revision
    w.put_u32(0); // vendor
    w.put_u16(channels);
    w.put_u16(16); // sample size
    w.put_u16(0); // compression id
    w.put_u16(0); // packet size
    w.put_u32(sample_rate.min(0xFFFF) << 16); // 16.16 fixed point

    let esds = w.begin_full_box(b"esds", 0, 0);
    // elementary stream descriptor tree, one-byte descriptor sizes
    let dec_specific_len = asc.len();
    let decoder_config_len = 13 + 2 + dec_specific_len;
    let es_len = 3 + 2 + decoder_config_len + 3;
    w.put_u8(0x03); // ES descriptor
    w.put_u8(es_len as u8);
    w.put_u16(track_id as u16);
    w.put_u8(0); // flags
    w.put_u8(0x04); // decoder config descriptor
    w.put_u8(decoder_config_len as u8);
    w.put_u8(0x40); // object type: AAC
    w.put_u8(0x15); // stream type: audio
    w.put_u8(0); // buffer size (u24)
    w.put_u16(0);
    w.put_u32(0); // max bitrate
    w.put_u32(0); // average bitrate
    w.put_u8(0x05); // decoder specific info
    w.put_u8(dec_specific_len as u8);
    w.put_slice(asc);
    w.put_u8(0x06); // SL config descriptor
    w.put_u8(1);
    w.put_u8(0x02);
    w.end_box(esds);

    w.end_box(mp4a);
}

fn write_unity_matrix(w: &mut BoxWriter) {
    w.put_u32(0x0001_0000);
    w.put_zeros(12);
    w.put_u32(0x0001_0000);
    w.put_zeros(12);
    w.put_u32(0x4000_0000);
}
