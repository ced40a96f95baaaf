//! Tokio-driven listener and connection loop.
//!
//! A `setup` call claims a connection slot, binds a listening socket, and
//!  spawns the connection task. Exactly one inbound connection is accepted
//!  per setup; the listener is dropped right after the accept. The task then
//!  delivers readable, write-completion and timer events into the locked
//!  state machine, keeping at most one outstanding read and one outstanding
//!  write, and tears the slot down once the machine reaches its terminal
//!  state.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, span, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::UplinkConfig;
use crate::secure::frame::SecureFrameChannel;
use crate::secure::keys::{SecretSource, SuiteKeys};
use crate::session::machine::{ConnectionEvent, UploadSession};
use crate::session::orchestrator::RecordingOrchestrator;
use crate::session::pool::{ConnectionPool, SlotRef};

/// Handle returned by a successful setup call.
#[derive(Debug, Clone, Copy)]
pub struct UploadHandle {
    pub slot: SlotRef,
    /// Effective listening address, to be advertised to the controller.
    pub local_addr: SocketAddr,
}

pub struct UplinkService {
    config: Arc<UplinkConfig>,
    pool: Arc<Mutex<ConnectionPool>>,
    orchestrator: Arc<RecordingOrchestrator>,
}

impl UplinkService {
    pub fn new(config: UplinkConfig) -> anyhow::Result<UplinkService> {
        config.validate()?;
        let orchestrator = Arc::new(RecordingOrchestrator::new(&config));
        let pool = Arc::new(Mutex::new(ConnectionPool::new(config.pool_slots)));
        Ok(UplinkService { config: Arc::new(config), pool, orchestrator })
    }

    /// Capture-side entry point, shared with the producer thread.
    pub fn orchestrator(&self) -> Arc<RecordingOrchestrator> {
        self.orchestrator.clone()
    }

    pub fn active_connections(&self) -> usize {
        self.pool.lock().unwrap().occupied_count()
    }

    /// Allocate a connection slot and a listening endpoint for one upload
    ///  session. Slot exhaustion is reported to the caller and leaves all
    ///  existing state untouched.
    pub async fn setup(&self, secrets: &dyn SecretSource) -> anyhow::Result<UploadHandle> {
        let slot = self.pool.lock().unwrap().acquire()?;

        let secret = secrets.session_secret();
        let keys = SuiteKeys::derive(&secret);
        let channel = SecureFrameChannel::accessory(&keys, self.config.max_frame_payload);
        let mut session = UploadSession::new(
            channel,
            self.config.stream_kind.clone(),
            self.config.max_frame_payload,
            self.config.response_timeout,
        );
        session.setup();

        let listener = match TcpListener::bind(self.config.listen_addr)
            .await
            .context("binding the upload listener")
        {
            Ok(listener) => listener,
            Err(e) => {
                self.pool.lock().unwrap().release(slot);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;
        session.listener_ready();
        info!("upload session listening on {:?} (slot {})", local_addr, slot.index);

        let session = Arc::new(Mutex::new(session));
        let notify = Arc::new(Notify::new());
        let correlation_id = Uuid::new_v4();
        let connection_span =
            span!(Level::DEBUG, "upload_connection", ?correlation_id, slot = slot.index);
        tokio::spawn(
            run_connection(
                self.config.clone(),
                self.pool.clone(),
                self.orchestrator.clone(),
                slot,
                session,
                notify,
                listener,
            )
            .instrument(connection_span),
        );

        Ok(UploadHandle { slot, local_addr })
    }
}

async fn run_connection(
    config: Arc<UplinkConfig>,
    pool: Arc<Mutex<ConnectionPool>>,
    orchestrator: Arc<RecordingOrchestrator>,
    slot: SlotRef,
    session: Arc<Mutex<UploadSession>>,
    notify: Arc<Notify>,
    listener: TcpListener,
) {
    // exactly one connection per setup; the listener closes after the accept
    let accepted = tokio::time::timeout(config.response_timeout, listener.accept()).await;
    drop(listener);
    let stream = match accepted {
        Ok(Ok((stream, peer))) => {
            debug!("accepted upload connection from {:?}", peer);
            stream
        }
        Ok(Err(e)) => {
            warn!("accept failed: {}", e);
            teardown(&pool, &orchestrator, slot);
            return;
        }
        Err(_) => {
            debug!("no connection within the response timeout");
            teardown(&pool, &orchestrator, slot);
            return;
        }
    };
    session.lock().unwrap().connection_accepted();

    let (mut read_half, mut write_half) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(16 * 1024);

    loop {
        // the whole inspect-decide-mutate sequence runs under the lock; only
        // the actual socket awaits happen outside it
        let (deadline, outbound) = {
            let mut session = session.lock().unwrap();
            (session.timer_deadline(), session.take_outbound())
        };

        if let Some(bytes) = outbound {
            // single outstanding write, drained fully before anything else
            if let Err(e) = write_half.write_all(&bytes).await {
                warn!("write failed: {}", e);
                break;
            }
            let bind_requested = {
                let mut session = session.lock().unwrap();
                session.handle_event(ConnectionEvent::WriteComplete);
                session.take_bind_request()
            };
            if bind_requested && !orchestrator.bind(slot, session.clone(), notify.clone()) {
                debug!("another upload session is active; this one stalls after the handshake");
            }
            continue;
        }

        if session.lock().unwrap().is_closed() {
            break;
        }

        let sleep_deadline = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            read = read_half.read_buf(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        debug!("peer closed the stream");
                        break;
                    }
                    Ok(_) => {
                        let mut session = session.lock().unwrap();
                        session.handle_event(ConnectionEvent::InboundBytes(&read_buf));
                        read_buf.clear();
                    }
                    Err(e) => {
                        warn!("read failed: {}", e);
                        break;
                    }
                }
            }
            _ = notify.notified() => {
                // the producer queued a chunk; the next iteration writes it
            }
            _ = tokio::time::sleep_until(sleep_deadline), if deadline.is_some() => {
                let mut session = session.lock().unwrap();
                // the timer may have been re-armed since the deadline was
                // snapshotted; only deliver an expiry of the live deadline
                if session.timer_deadline() == deadline {
                    session.handle_event(ConnectionEvent::TimerFired);
                }
            }
        }
    }

    teardown(&pool, &orchestrator, slot);
}

fn teardown(
    pool: &Arc<Mutex<ConnectionPool>>,
    orchestrator: &Arc<RecordingOrchestrator>,
    slot: SlotRef,
) {
    orchestrator.unbind(slot);
    pool.lock().unwrap().release(slot);
    debug!("connection slot {} released", slot.index);
}
