use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

/// Frame payloads are length-prefixed with a u24, so no ciphertext can ever
///  exceed this many bytes.
pub const MAX_WIRE_PAYLOAD: usize = 0x00FF_FFFF;

pub struct UplinkConfig {
    /// Address the per-session listener binds to. Port 0 lets the OS pick; the
    ///  effective address is reported back by the setup call so it can be
    ///  advertised to the controller.
    pub listen_addr: SocketAddr,

    /// Number of connection slots. One slot is bound to the recording
    ///  orchestrator and makes forward progress; the others only exist so that
    ///  setup calls arriving while a session is active can still run the
    ///  handshake.
    pub pool_slots: usize,

    /// Response timeout covering the accept and every subsequent wait state.
    ///  Arming the timer always replaces the previous deadline, so at most one
    ///  timer is live per connection.
    pub response_timeout: Duration,

    /// Upper bound for the media payload of a single data chunk. An item
    ///  larger than this is split across chunks, deferring the remainder.
    pub max_chunk_size: usize,

    /// Upper bound accepted for a single frame's ciphertext, inbound and
    ///  outbound. Must leave room for `max_chunk_size` plus message framing.
    pub max_frame_payload: usize,

    /// Stream kind accepted in the open request.
    pub stream_kind: String,

    pub video: VideoTrackConfig,
    pub audio: Option<AudioTrackConfig>,
}

pub struct VideoTrackConfig {
    /// Ticks per second of capture timestamps and durations.
    pub timescale: u32,
    pub width: u16,
    pub height: u16,
    /// Number of sample descriptors the ring retains.
    pub ring_slots: usize,
    /// Size of the ring's byte arena.
    pub ring_bytes: usize,
}

pub struct AudioTrackConfig {
    pub timescale: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// AudioSpecificConfig bytes for the decoder configuration record,
    ///  supplied by the encoder at configuration time.
    pub audio_specific_config: Vec<u8>,
    pub ring_slots: usize,
    pub ring_bytes: usize,
}

impl UplinkConfig {
    pub fn default_for(listen_addr: SocketAddr) -> UplinkConfig {
        UplinkConfig {
            listen_addr,
            pool_slots: 2,
            response_timeout: Duration::from_secs(10),
            max_chunk_size: 256 * 1024,
            max_frame_payload: 256 * 1024 + 4096,
            stream_kind: "ipcamera.recording".to_owned(),
            video: VideoTrackConfig {
                timescale: 90_000,
                width: 1920,
                height: 1080,
                ring_slots: 256,
                ring_bytes: 8 * 1024 * 1024,
            },
            audio: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool_slots == 0 {
            bail!("at least one connection slot is required");
        }
        if self.response_timeout.is_zero() {
            bail!("response timeout must be non-zero");
        }
        if self.max_chunk_size < 4096 {
            bail!("max chunk size is too small");
        }
        if self.max_frame_payload > MAX_WIRE_PAYLOAD {
            bail!("max frame payload exceeds the u24 length field");
        }
        if self.max_frame_payload < self.max_chunk_size + 1024 {
            bail!("max frame payload leaves no room for chunk framing");
        }
        if self.stream_kind.is_empty() {
            bail!("stream kind must be non-empty");
        }
        self.validate_track("video", self.video.timescale, self.video.ring_slots, self.video.ring_bytes)?;
        if let Some(audio) = &self.audio {
            self.validate_track("audio", audio.timescale, audio.ring_slots, audio.ring_bytes)?;
            if audio.audio_specific_config.is_empty() {
                bail!("audio track needs an AudioSpecificConfig");
            }
            if audio.audio_specific_config.len() > 64 {
                bail!("AudioSpecificConfig is implausibly large");
            }
            if audio.channels == 0 {
                bail!("audio track needs at least one channel");
            }
        }
        Ok(())
    }

    fn validate_track(&self, name: &str, timescale: u32, slots: usize, bytes: usize) -> anyhow::Result<()> {
        if timescale == 0 {
            bail!("{} timescale must be non-zero", name);
        }
        if slots < 2 {
            bail!("{} ring needs at least two slots", name);
        }
        if bytes < 4096 {
            bail!("{} ring arena is too small", name);
        }
        Ok(())
    }
}
