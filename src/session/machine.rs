//! Per-connection transport state machine.
//!
//! ```ascii
//! IDLE -> SETUP -> ACCEPT -> WAIT_FOR_HELLO -> SEND_HELLO -> WAIT_FOR_OPEN
//!      -> SEND_OPEN -> GET_CHUNK <-> SEND_CHUNK -> WAIT_FOR_ACK -> SEND_CLOSE
//!      -> CLOSE
//! ```
//!
//! Events reach the machine through a single dispatch entry point
//!  ([`UploadSession::handle_event`]): readable bytes, write completion, or
//!  timer expiry. The machine owns the connection's encrypted channel, the
//!  partially-received inbound buffer, the outbound buffer the reactor drains,
//!  and the response-timer deadline. Every transition into a non-terminal
//!  state re-arms the response timer (arming replaces the previous deadline,
//!  so at most one timer is ever live); entering CLOSE disarms it.
//!
//! Error containment: framing errors, authentication failures and protocol
//!  violations are logged and collapse the connection to CLOSE. They never
//!  propagate past the connection boundary.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::UplinkError;
use crate::secure::frame::{FrameType, SecureFrameChannel};
use crate::wire::messages::{self, InboundMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Setup,
    Accept,
    WaitForHello,
    SendHello,
    WaitForOpen,
    SendOpen,
    GetChunk,
    SendChunk,
    WaitForAck,
    SendClose,
    Close,
}

/// Socket and timer readiness, delivered by the reactor.
pub enum ConnectionEvent<'a> {
    /// Bytes arrived on the connection (possibly a partial frame).
    InboundBytes(&'a [u8]),
    /// The previously queued outbound bytes were fully written.
    WriteComplete,
    /// The response timer expired.
    TimerFired,
}

/// Bookkeeping of the data item currently being transferred. Reset when a new
///  transfer begins, mutated once per produced chunk; every read-modify-write
///  happens under the per-connection lock.
#[derive(Debug, Default)]
pub struct ChunkContext {
    pub stream_id: i64,
    pub data_total_size: u64,
    pub sent_data_size: u64,
    pub data_sequence_number: i64,
    pub data_chunk_sequence_number: i64,
    pub is_last_data_chunk: bool,
    pub end_of_stream_requested: bool,
    pub close_requested: bool,
    pub overflowed: bool,
    pub chunk_needed: bool,
    /// Set when the submitted chunk was the terminal one; its write
    ///  completion moves to WAIT_FOR_ACK instead of back to GET_CHUNK.
    pub end_of_stream_sent: bool,
}

pub struct UploadSession {
    state: SessionState,
    channel: SecureFrameChannel,
    inbound: BytesMut,
    outbound: BytesMut,
    max_frame_payload: usize,
    response_timeout: Duration,
    deadline: Option<Instant>,
    /// Stream kind this accessory accepts in the open request.
    stream_kind: String,
    stream_id: Option<i64>,
    bind_requested: bool,
    pub chunk: ChunkContext,
}

impl UploadSession {
    pub fn new(
        channel: SecureFrameChannel,
        stream_kind: String,
        max_frame_payload: usize,
        response_timeout: Duration,
    ) -> UploadSession {
        UploadSession {
            state: SessionState::Idle,
            channel,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            max_frame_payload,
            response_timeout,
            deadline: None,
            stream_kind,
            stream_id: None,
            bind_requested: false,
            chunk: ChunkContext::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Close
    }

    pub fn stream_id(&self) -> Option<i64> {
        self.stream_id
    }

    /// Deadline of the armed response timer, `None` while disarmed.
    pub fn timer_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The only transition out of IDLE.
    pub fn setup(&mut self) {
        if self.state == SessionState::Idle {
            self.transition(SessionState::Setup);
        }
    }

    /// The listening endpoint is allocated.
    pub fn listener_ready(&mut self) {
        if self.state == SessionState::Setup {
            self.transition(SessionState::Accept);
        }
    }

    /// The single inbound connection was accepted (the listener is closed by
    ///  the reactor right after this).
    pub fn connection_accepted(&mut self) {
        if self.state == SessionState::Accept {
            self.transition(SessionState::WaitForHello);
        }
    }

    /// Set right after the open response write completes; the reactor
    ///  consumes it and binds the session to the recording orchestrator.
    pub fn take_bind_request(&mut self) -> bool {
        std::mem::take(&mut self.bind_requested)
    }

    /// Outbound bytes pending transmission, if any. The reactor keeps a
    ///  single outstanding write and reports back with
    ///  [`ConnectionEvent::WriteComplete`].
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.split().freeze())
        }
    }

    pub fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::InboundBytes(bytes) => self.on_inbound(bytes),
            ConnectionEvent::WriteComplete => self.on_write_complete(),
            ConnectionEvent::TimerFired => self.on_timer_fired(),
        }
    }

    /// Encrypt and queue one media chunk. Producer-side entry point, called
    ///  under the per-connection lock while the machine is in GET_CHUNK.
    pub fn submit_chunk(&mut self, payload: &[u8], end_of_stream: bool) -> Result<(), UplinkError> {
        if self.state != SessionState::GetChunk || !self.chunk.chunk_needed {
            return Err(UplinkError::UnexpectedMessage("chunk submission outside GET_CHUNK"));
        }
        let frame = self.channel.encode_frame(FrameType::Message, payload)?;
        self.outbound.extend_from_slice(&frame);
        self.chunk.chunk_needed = false;
        self.chunk.end_of_stream_sent = end_of_stream;
        self.transition(SessionState::SendChunk);
        Ok(())
    }

    fn on_timer_fired(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Close => {}
            state => {
                debug!("response timeout in {:?}", state);
                self.close();
            }
        }
    }

    fn on_write_complete(&mut self) {
        match self.state {
            SessionState::SendHello => self.transition(SessionState::WaitForOpen),
            SessionState::SendOpen => {
                self.bind_requested = true;
                self.chunk.chunk_needed = true;
                self.transition(SessionState::GetChunk);
            }
            SessionState::SendChunk => {
                if self.chunk.end_of_stream_sent {
                    self.transition(SessionState::WaitForAck);
                } else {
                    self.chunk.chunk_needed = true;
                    self.transition(SessionState::GetChunk);
                }
            }
            SessionState::SendClose => self.close(),
            _ => {}
        }
    }

    fn on_inbound(&mut self, bytes: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.inbound.extend_from_slice(bytes);

        loop {
            let total = match SecureFrameChannel::complete_frame_len(&self.inbound, self.max_frame_payload)
            {
                Ok(None) => break,
                Ok(Some(total)) => total,
                Err(e) => return self.fail(e),
            };
            if self.inbound.len() < total {
                // partial frame, wait for more bytes
                break;
            }
            let frame = self.inbound.split_to(total);
            let plaintext = match self.channel.decode_frame(&frame) {
                Ok((_, plaintext)) => plaintext,
                Err(e) => return self.fail(e),
            };
            let message = match messages::parse_inbound(&plaintext) {
                Ok(message) => message,
                Err(e) => return self.fail(e.into()),
            };
            self.on_message(message);
            if self.is_closed() {
                return;
            }
        }
    }

    fn on_message(&mut self, message: InboundMessage) {
        match (self.state, message) {
            (SessionState::WaitForHello, InboundMessage::Hello(hello)) => {
                trace!("hello request {}", hello.id);
                let response = messages::encode_hello_response(hello.id);
                if let Err(e) = self.queue_message(&response) {
                    return self.fail(e);
                }
                self.transition(SessionState::SendHello);
            }
            (SessionState::WaitForOpen, InboundMessage::Open(open)) => {
                if open.stream_kind != self.stream_kind {
                    return self.fail(UplinkError::UnexpectedMessage("unsupported stream kind"));
                }
                trace!("open request {} for stream {}", open.id, open.stream_id);
                self.stream_id = Some(open.stream_id);
                self.chunk = ChunkContext { stream_id: open.stream_id, ..ChunkContext::default() };
                let response = messages::encode_open_response(open.id);
                if let Err(e) = self.queue_message(&response) {
                    return self.fail(e);
                }
                self.transition(SessionState::SendOpen);
            }
            (SessionState::GetChunk | SessionState::SendChunk, InboundMessage::Close(close)) => {
                // latched, honored at the next fragment boundary
                debug!("close received mid-transfer (reason {}), latching end of stream", close.reason);
                self.chunk.close_requested = true;
                self.chunk.end_of_stream_requested = true;
            }
            (SessionState::GetChunk | SessionState::SendChunk, _) => {
                warn!("unexpected message during chunk exchange, ending the session");
                self.close();
            }
            (SessionState::WaitForAck, InboundMessage::Ack(_) | InboundMessage::Close(_)) => {
                let stream_id = self.stream_id.unwrap_or_default();
                let close = messages::encode_close_event(stream_id, 0);
                if let Err(e) = self.queue_message(&close) {
                    return self.fail(e);
                }
                self.transition(SessionState::SendClose);
            }
            (state, _) => {
                self.fail(UplinkError::UnexpectedMessage(state_name(state)));
            }
        }
    }

    fn queue_message(&mut self, payload: &[u8]) -> Result<(), UplinkError> {
        let frame = self.channel.encode_frame(FrameType::Message, payload)?;
        self.outbound.extend_from_slice(&frame);
        Ok(())
    }

    fn fail(&mut self, error: UplinkError) {
        warn!("abandoning connection: {}", error);
        self.close();
    }

    /// Idempotent: discard buffers, disarm the timer, release the state. The
    ///  reactor unbinds from the orchestrator and frees the slot when it sees
    ///  the session closed.
    fn close(&mut self) {
        if self.state == SessionState::Close {
            return;
        }
        trace!("{:?} -> Close", self.state);
        self.state = SessionState::Close;
        self.inbound.clear();
        self.outbound.clear();
        self.deadline = None;
    }

    fn transition(&mut self, next: SessionState) {
        trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
        // every active state is covered by the response timer; re-arming
        // replaces the previous deadline
        self.deadline = Some(Instant::now() + self.response_timeout);
    }
}

fn state_name(state: SessionState) -> &'static str {
    match state {
        SessionState::Idle => "message in IDLE",
        SessionState::Setup => "message in SETUP",
        SessionState::Accept => "message in ACCEPT",
        SessionState::WaitForHello => "message in WAIT_FOR_HELLO",
        SessionState::SendHello => "message in SEND_HELLO",
        SessionState::WaitForOpen => "message in WAIT_FOR_OPEN",
        SessionState::SendOpen => "message in SEND_OPEN",
        SessionState::GetChunk => "message in GET_CHUNK",
        SessionState::SendChunk => "message in SEND_CHUNK",
        SessionState::WaitForAck => "message in WAIT_FOR_ACK",
        SessionState::SendClose => "message in SEND_CLOSE",
        SessionState::Close => "message in CLOSE",
    }
}
