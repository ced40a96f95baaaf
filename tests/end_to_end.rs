//! End-to-end: a simulated controller drives hello -> open -> chunk exchange
//! -> close against a real listening session, then the reassembled container
//! (init segment plus all fragments in order) is structurally validated.

use std::time::Duration;

use anyhow::{bail, ensure, Context};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::Level;

use uplink::config::UplinkConfig;
use uplink::mux::TrackKind;
use uplink::secure::frame::{FrameType, SecureFrameChannel};
use uplink::secure::keys::{SecretSource, SessionSecret, SuiteKeys};
use uplink::session::reactor::UplinkService;
use uplink::wire::reader::Reader;
use uplink::wire::value::{self, Value};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

const MAX_FRAME_PAYLOAD: usize = 256 * 1024 + 4096;
const STREAM_ID: i64 = 7;
const FRAME_TICKS: u64 = 3750; // 24 fps at a 90 kHz timescale
const KEYFRAME_INTERVAL: u64 = 8;

struct TestPairing;

impl SecretSource for TestPairing {
    fn session_secret(&self) -> SessionSecret {
        SessionSecret {
            shared_secret: b"end to end shared secret".to_vec(),
            local_salt: [0x11; 32],
            peer_salt: [0x22; 32],
        }
    }
}

fn sample_bytes(i: u64) -> Vec<u8> {
    let keyframe = i % KEYFRAME_INTERVAL == 0;
    let mut data = vec![if keyframe { 0x65 } else { 0x41 }, i as u8, (i >> 8) as u8];
    data.resize(100 + (i as usize % 7) * 13, 0xAB);
    data
}

fn dict_get<'d>(dict: &'d [(String, Value)], key: &str) -> Option<&'d Value> {
    dict.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn encode_two_dicts(header: Value, body: Option<Value>) -> Bytes {
    let mut buf = BytesMut::new();
    value::encode(&header, &mut buf);
    if let Some(body) = body {
        value::encode(&body, &mut buf);
    }
    buf.freeze()
}

#[derive(Debug, Clone)]
struct ReceivedChunk {
    data_type: String,
    data_sequence_number: i64,
    data_chunk_sequence_number: i64,
    data_total_size: Option<i64>,
    is_last_data_chunk: bool,
    end_of_stream: bool,
    blob: Bytes,
}

struct ControllerReport {
    chunks: Vec<ReceivedChunk>,
    frames_received: u64,
    frames_sent: u64,
    accessory_close_reason: i64,
}

async fn read_frame(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    channel: &mut SecureFrameChannel,
) -> anyhow::Result<Bytes> {
    loop {
        if let Some(total) = SecureFrameChannel::complete_frame_len(buf, MAX_FRAME_PAYLOAD)? {
            if buf.len() >= total {
                let frame = buf.split_to(total);
                let (frame_type, payload) = channel.decode_frame(&frame)?;
                ensure!(frame_type == FrameType::Message);
                return Ok(payload);
            }
        }
        let n = stream.read_buf(buf).await.context("reading from the accessory")?;
        ensure!(n > 0, "accessory closed the stream unexpectedly");
    }
}

async fn send_message(
    stream: &mut TcpStream,
    channel: &mut SecureFrameChannel,
    payload: &[u8],
) -> anyhow::Result<()> {
    let frame = channel.encode_frame(FrameType::Message, payload)?;
    stream.write_all(&frame).await.context("writing to the accessory")
}

fn parse_two_dicts(payload: &[u8]) -> anyhow::Result<(Vec<(String, Value)>, Vec<(String, Value)>)> {
    let mut reader = Reader::new(payload);
    let header = match reader.read_value()? {
        Value::Dict(d) => d,
        other => bail!("header is not a dictionary: {:?}", other),
    };
    let body = match reader.read_value()? {
        Value::Dict(d) => d,
        other => bail!("body is not a dictionary: {:?}", other),
    };
    ensure!(reader.is_empty(), "trailing bytes in message");
    Ok((header, body))
}

fn expect_status_zero_response(payload: &[u8], response: &str, id: i64) -> anyhow::Result<()> {
    let (header, body) = parse_two_dicts(payload)?;
    ensure!(dict_get(&header, "response") == Some(&Value::String(response.to_owned())));
    ensure!(dict_get(&header, "id") == Some(&Value::Int(id)));
    ensure!(dict_get(&body, "status") == Some(&Value::Int(0)));
    Ok(())
}

fn parse_data_event(body: &[(String, Value)]) -> anyhow::Result<ReceivedChunk> {
    ensure!(dict_get(body, "streamId") == Some(&Value::Int(STREAM_ID)));
    let end_of_stream = dict_get(body, "endOfStream") == Some(&Value::Bool(true));
    let packets = dict_get(body, "packets")
        .and_then(Value::as_array)
        .context("data event without packets")?;
    ensure!(packets.len() == 1, "one packet per data event");
    let packet = packets[0].as_dict().context("packet is not a dictionary")?;
    let metadata = dict_get(packet, "metadata")
        .and_then(Value::as_dict)
        .context("packet without metadata")?;
    let blob = dict_get(packet, "data").and_then(Value::as_data).context("packet without data")?;

    Ok(ReceivedChunk {
        data_type: dict_get(metadata, "dataType")
            .and_then(Value::as_str)
            .context("missing dataType")?
            .to_owned(),
        data_sequence_number: dict_get(metadata, "dataSequenceNumber")
            .and_then(Value::as_int)
            .context("missing dataSequenceNumber")?,
        data_chunk_sequence_number: dict_get(metadata, "dataChunkSequenceNumber")
            .and_then(Value::as_int)
            .context("missing dataChunkSequenceNumber")?,
        data_total_size: dict_get(metadata, "dataTotalSize").and_then(Value::as_int),
        is_last_data_chunk: dict_get(metadata, "isLastDataChunk")
            .and_then(Value::as_bool)
            .context("missing isLastDataChunk")?,
        end_of_stream,
        blob: blob.clone(),
    })
}

/// Handshake, collect chunks, request the close after a few complete
/// fragments, acknowledge the terminal chunk, and wait for the accessory's
/// own close event.
async fn run_controller(
    addr: std::net::SocketAddr,
    fragments_before_close: usize,
) -> anyhow::Result<ControllerReport> {
    let keys = SuiteKeys::derive(&TestPairing.session_secret());
    let mut channel = SecureFrameChannel::controller(&keys, MAX_FRAME_PAYLOAD);
    let mut stream = TcpStream::connect(addr).await?;
    let mut buf = BytesMut::with_capacity(64 * 1024);

    let hello = encode_two_dicts(
        Value::Dict(vec![
            ("request".to_owned(), Value::String("hello".to_owned())),
            ("protocol".to_owned(), Value::String("control".to_owned())),
            ("id".to_owned(), Value::Int(1)),
        ]),
        None,
    );
    send_message(&mut stream, &mut channel, &hello).await?;
    let response = read_frame(&mut stream, &mut buf, &mut channel).await?;
    expect_status_zero_response(&response, "hello", 1)?;

    let open = encode_two_dicts(
        Value::Dict(vec![
            ("request".to_owned(), Value::String("open".to_owned())),
            ("protocol".to_owned(), Value::String("dataSend".to_owned())),
            ("id".to_owned(), Value::Int(2)),
        ]),
        Some(Value::Dict(vec![
            ("target".to_owned(), Value::String("controller".to_owned())),
            ("type".to_owned(), Value::String("ipcamera.recording".to_owned())),
            ("streamId".to_owned(), Value::Int(STREAM_ID)),
        ])),
    );
    send_message(&mut stream, &mut channel, &open).await?;
    let response = read_frame(&mut stream, &mut buf, &mut channel).await?;
    expect_status_zero_response(&response, "open", 2)?;

    let mut chunks: Vec<ReceivedChunk> = Vec::new();
    let mut fragments_received = 0usize;
    let mut close_sent = false;
    let accessory_close_reason;
    loop {
        let payload = read_frame(&mut stream, &mut buf, &mut channel).await?;
        let (header, body) = parse_two_dicts(&payload)?;
        match dict_get(&header, "event").and_then(Value::as_str) {
            Some("data") => {
                let chunk = parse_data_event(&body)?;
                let terminal = chunk.end_of_stream;
                if chunk.is_last_data_chunk && chunk.data_type == "mediaFragment" {
                    fragments_received += 1;
                }
                chunks.push(chunk);

                if terminal {
                    let ack = encode_two_dicts(
                        Value::Dict(vec![
                            ("event".to_owned(), Value::String("ack".to_owned())),
                            ("protocol".to_owned(), Value::String("dataSend".to_owned())),
                        ]),
                        Some(Value::Dict(vec![
                            ("streamId".to_owned(), Value::Int(STREAM_ID)),
                            ("endOfStream".to_owned(), Value::Bool(true)),
                        ])),
                    );
                    send_message(&mut stream, &mut channel, &ack).await?;
                } else if fragments_received >= fragments_before_close && !close_sent {
                    let close = encode_two_dicts(
                        Value::Dict(vec![
                            ("event".to_owned(), Value::String("close".to_owned())),
                            ("protocol".to_owned(), Value::String("dataSend".to_owned())),
                        ]),
                        Some(Value::Dict(vec![
                            ("streamId".to_owned(), Value::Int(STREAM_ID)),
                            ("reason".to_owned(), Value::Int(0)),
                        ])),
                    );
                    send_message(&mut stream, &mut channel, &close).await?;
                    close_sent = true;
                }
            }
            Some("close") => {
                accessory_close_reason = dict_get(&body, "reason")
                    .and_then(Value::as_int)
                    .context("close without reason")?;
                break;
            }
            other => bail!("unexpected event from the accessory: {:?}", other),
        }
    }

    Ok(ControllerReport {
        chunks,
        frames_received: channel.recv_nonce(),
        frames_sent: channel.send_nonce(),
        accessory_close_reason,
    })
}

fn read_u32_be(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_u64_be(data: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(data[offset..offset + 8].try_into().unwrap())
}

/// Flat walk of consecutive boxes, validating sizes against the buffer.
fn walk_boxes(data: &[u8]) -> Vec<(String, usize, usize)> {
    let mut boxes = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        assert!(pos + 8 <= data.len(), "truncated box header at {}", pos);
        let size = read_u32_be(data, pos) as usize;
        let fourcc = String::from_utf8(data[pos + 4..pos + 8].to_vec()).unwrap();
        assert!(size >= 8, "box {} has an invalid size", fourcc);
        assert!(pos + size <= data.len(), "box {} overruns the container", fourcc);
        boxes.push((fourcc, pos, size));
        pos += size;
    }
    boxes
}

/// Validate the reassembled container and return the total sample count.
fn validate_container(container: &[u8]) -> usize {
    let top = walk_boxes(container);
    assert!(top.len() >= 4, "container should hold at least one fragment");
    assert_eq!(top[0].0, "ftyp");
    assert_eq!(top[1].0, "moov");

    let mut total_samples = 0usize;
    let mut expected_sequence = 1u32;
    let mut expected_base_decode_time = 0u64;
    let mut fragment_boxes = top[2..].iter();
    loop {
        let Some((fourcc, moof_pos, moof_size)) = fragment_boxes.next() else { break };
        assert_eq!(fourcc, "moof");
        let (mdat_fourcc, mdat_pos, mdat_size) =
            fragment_boxes.next().expect("every moof is followed by its mdat");
        assert_eq!(mdat_fourcc, "mdat");

        let moof_children = walk_boxes(&container[moof_pos + 8..moof_pos + moof_size]);
        assert_eq!(moof_children[0].0, "mfhd");
        let mfhd_pos = moof_pos + 8 + moof_children[0].1;
        assert_eq!(read_u32_be(container, mfhd_pos + 12), expected_sequence);
        expected_sequence += 1;

        assert_eq!(moof_children[1].0, "traf");
        let traf_pos = moof_pos + 8 + moof_children[1].1;
        let traf_size = moof_children[1].2;
        let traf_children = walk_boxes(&container[traf_pos + 8..traf_pos + traf_size]);
        assert_eq!(traf_children[0].0, "tfhd");
        assert_eq!(traf_children[1].0, "tfdt");
        assert_eq!(traf_children[2].0, "trun");

        let tfdt_pos = traf_pos + 8 + traf_children[1].1;
        assert_eq!(read_u64_be(container, tfdt_pos + 12), expected_base_decode_time);

        let trun_pos = traf_pos + 8 + traf_children[2].1;
        let sample_count = read_u32_be(container, trun_pos + 12) as usize;
        let data_offset = read_u32_be(container, trun_pos + 16) as usize;
        assert_eq!(data_offset, moof_size + 8, "payload starts right after the mdat header");

        let mut payload_pos = mdat_pos + 8;
        for sample_in_run in 0..sample_count {
            let entry = trun_pos + 20 + sample_in_run * 12;
            let duration = read_u32_be(container, entry) as u64;
            let size = read_u32_be(container, entry + 4) as usize;
            let flags = read_u32_be(container, entry + 8);

            let global_index = (total_samples + sample_in_run) as u64;
            assert_eq!(duration, FRAME_TICKS);
            let expected_keyframe = global_index % KEYFRAME_INTERVAL == 0;
            assert_eq!(
                flags,
                if expected_keyframe { 0x0200_0000 } else { 0x0101_0000 },
                "sample {} flags",
                global_index
            );
            if sample_in_run == 0 {
                assert!(expected_keyframe, "every fragment must start at a keyframe");
            }

            let expected = sample_bytes(global_index);
            assert_eq!(size, expected.len(), "sample {} size", global_index);
            assert_eq!(
                &container[payload_pos..payload_pos + size],
                expected.as_slice(),
                "sample {} payload",
                global_index
            );
            payload_pos += size;
            expected_base_decode_time += duration;
        }
        assert_eq!(payload_pos, mdat_pos + mdat_size, "mdat holds exactly the run's samples");
        total_samples += sample_count;
    }

    total_samples
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_session_yields_a_valid_container() {
    let config = UplinkConfig::default_for("127.0.0.1:0".parse().unwrap());
    assert_eq!(config.max_frame_payload, MAX_FRAME_PAYLOAD);
    let service = UplinkService::new(config).unwrap();
    let orchestrator = service.orchestrator();

    let handle = service.setup(&TestPairing).await.unwrap();
    let controller = tokio::spawn(run_controller(handle.local_addr, 3));

    // capture producer: parameter sets first, then a steady 24 fps stream
    orchestrator.push_sample(TrackKind::Video, &[0x67, 0x42, 0x00, 0x1E, 0xDA, 0x02], 0, false);
    orchestrator.push_sample(TrackKind::Video, &[0x68, 0xCE, 0x38, 0x80], 0, false);
    let mut i = 0u64;
    while !controller.is_finished() {
        orchestrator.push_sample(
            TrackKind::Video,
            &sample_bytes(i),
            i * FRAME_TICKS,
            i % KEYFRAME_INTERVAL == 0,
        );
        i += 1;
        assert!(i < 5000, "controller never finished");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let report = controller.await.unwrap().unwrap();

    // the terminal close walked the full path
    assert_eq!(report.accessory_close_reason, 0);

    // data item bookkeeping: the init segment is item 1, fragments follow
    // with contiguous sequence numbers; totals are declared on first chunks
    // only and match the summed chunk sizes
    assert_eq!(report.chunks[0].data_type, "mediaInitialization");
    assert_eq!(report.chunks[0].data_sequence_number, 1);
    let mut item_sequence = 1;
    let mut chunk_sequence = 0;
    let mut declared_total: Option<i64> = None;
    let mut item_bytes: i64 = 0;
    for chunk in &report.chunks {
        if chunk.data_sequence_number != item_sequence {
            assert_eq!(chunk.data_sequence_number, item_sequence + 1, "items are contiguous");
            item_sequence += 1;
            chunk_sequence = 0;
            declared_total = None;
            item_bytes = 0;
        }
        chunk_sequence += 1;
        assert_eq!(chunk.data_chunk_sequence_number, chunk_sequence);
        if chunk_sequence == 1 {
            declared_total = chunk.data_total_size;
            assert!(declared_total.is_some(), "first chunk declares the item's total size");
        } else {
            assert!(chunk.data_total_size.is_none(), "only the first chunk declares the total");
        }
        item_bytes += chunk.blob.len() as i64;
        assert!(item_bytes <= declared_total.unwrap(), "sent size never exceeds the declared total");
        if chunk.is_last_data_chunk {
            assert_eq!(item_bytes, declared_total.unwrap());
        }
        if chunk.data_type == "mediaFragment" {
            assert!(item_sequence >= 2);
        }
    }
    let terminal = report.chunks.last().unwrap();
    assert!(terminal.is_last_data_chunk && terminal.end_of_stream);

    // nonce sequences: every frame decrypted in order, counters 0..N-1
    assert_eq!(report.frames_received, report.chunks.len() as u64 + 3);
    assert_eq!(report.frames_sent, 4); // hello, open, close, ack

    // reassemble and validate the container
    let container: Vec<u8> =
        report.chunks.iter().flat_map(|chunk| chunk.blob.iter().copied()).collect();
    let total_samples = validate_container(&container);
    // the close was requested after three complete fragments, so the terminal
    // fragment is at least the fourth; every sample the container reports was
    // pushed, in order, gapless from sample 0
    assert!(total_samples >= 4 * KEYFRAME_INTERVAL as usize);
    assert_eq!(total_samples % KEYFRAME_INTERVAL as usize, 0);
    assert!((total_samples as u64) < i);

    // the slot is released once the connection winds down
    for _ in 0..100 {
        if service.active_connections() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(service.active_connections(), 0);
}

/// Slot exhaustion is reported to the setup caller and leaves existing
/// sessions untouched.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn setup_fails_cleanly_when_slots_are_exhausted() {
    let mut config = UplinkConfig::default_for("127.0.0.1:0".parse().unwrap());
    config.pool_slots = 1;
    let service = UplinkService::new(config).unwrap();

    let first = service.setup(&TestPairing).await.unwrap();
    let second = service.setup(&TestPairing).await;
    assert!(second.is_err());
    assert_eq!(service.active_connections(), 1);

    // the first session is still there and accepts its connection
    let stream = TcpStream::connect(first.local_addr).await;
    assert!(stream.is_ok());
}
