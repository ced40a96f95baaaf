//! Message schemas of the upload protocol. Each message is a header
//!  dictionary optionally followed by a second, separate message dictionary,
//!  concatenated in one frame payload.
//!
//! Inbound parsing is strict: dictionary member counts, key identities and
//!  value types must match the schema. The one sanctioned exception is the
//!  open request's message body, where unknown extra keys are ignored.

use bytes::{Bytes, BytesMut};

use super::reader::Reader;
use super::value::{self, Value};
use super::WireError;

pub const PROTOCOL_CONTROL: &str = "control";
pub const PROTOCOL_DATA_SEND: &str = "dataSend";

pub const DATA_TYPE_MEDIA_INITIALIZATION: &str = "mediaInitialization";
pub const DATA_TYPE_MEDIA_FRAGMENT: &str = "mediaFragment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloRequest {
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub id: i64,
    pub stream_kind: String,
    pub stream_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEvent {
    pub stream_id: i64,
    pub end_of_stream: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub stream_id: i64,
    pub reason: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Hello(HelloRequest),
    Open(OpenRequest),
    Ack(AckEvent),
    Close(CloseEvent),
}

/// Metadata of one media data chunk. `data_total_size` is present on the
///  first chunk of an item only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub data_total_size: Option<i64>,
    pub data_type: &'static str,
    pub data_sequence_number: i64,
    pub is_last_data_chunk: bool,
    pub data_chunk_sequence_number: i64,
}

pub fn parse_inbound(payload: &[u8]) -> Result<InboundMessage, WireError> {
    let mut reader = Reader::new(payload);
    let header = match reader.read_value()? {
        Value::Dict(members) => members,
        _ => return Err(WireError::Schema("message header must be a dictionary")),
    };
    let body = if reader.is_empty() {
        Vec::new()
    } else {
        match reader.read_value()? {
            Value::Dict(members) => members,
            _ => return Err(WireError::Schema("message body must be a dictionary")),
        }
    };
    if !reader.is_empty() {
        return Err(WireError::Schema("trailing bytes after message body"));
    }

    if let Some(request) = get(&header, "request") {
        let request = request.as_str().ok_or(WireError::Schema("request name must be a string"))?;
        let protocol = require_str(&header, "protocol")?;
        let id = require_int(&header, "id")?;
        if header.len() != 3 {
            return Err(WireError::Schema("request header must have exactly three members"));
        }
        return match (request, protocol) {
            ("hello", PROTOCOL_CONTROL) => {
                if !body.is_empty() {
                    return Err(WireError::Schema("hello request carries no message body"));
                }
                Ok(InboundMessage::Hello(HelloRequest { id }))
            }
            ("open", PROTOCOL_DATA_SEND) => parse_open_body(id, &body),
            _ => Err(WireError::Schema("unknown request")),
        };
    }

    if let Some(event) = get(&header, "event") {
        let event = event.as_str().ok_or(WireError::Schema("event name must be a string"))?;
        let protocol = require_str(&header, "protocol")?;
        if header.len() != 2 {
            return Err(WireError::Schema("event header must have exactly two members"));
        }
        if protocol != PROTOCOL_DATA_SEND {
            return Err(WireError::Schema("unknown event protocol"));
        }
        return match event {
            "ack" => parse_ack_body(&body),
            "close" => parse_close_body(&body),
            _ => Err(WireError::Schema("unknown event")),
        };
    }

    Err(WireError::Schema("message header carries neither request nor event"))
}

/// Unknown extra keys are ignored here (and only here): controllers attach
///  additional open parameters this accessory has no use for.
fn parse_open_body(id: i64, body: &[(String, Value)]) -> Result<InboundMessage, WireError> {
    let target = require_str(body, "target")?;
    if target != "controller" {
        return Err(WireError::Schema("open target must be the controller"));
    }
    let stream_kind = require_str(body, "type")?.to_owned();
    let stream_id = require_int(body, "streamId")?;
    Ok(InboundMessage::Open(OpenRequest { id, stream_kind, stream_id }))
}

fn parse_ack_body(body: &[(String, Value)]) -> Result<InboundMessage, WireError> {
    let stream_id = require_int(body, "streamId")?;
    let end_of_stream = match get(body, "endOfStream") {
        None => None,
        Some(v) => Some(v.as_bool().ok_or(WireError::Schema("endOfStream must be a boolean"))?),
    };
    let expected = if end_of_stream.is_some() { 2 } else { 1 };
    if body.len() != expected {
        return Err(WireError::Schema("unexpected member in ack body"));
    }
    Ok(InboundMessage::Ack(AckEvent { stream_id, end_of_stream }))
}

fn parse_close_body(body: &[(String, Value)]) -> Result<InboundMessage, WireError> {
    let stream_id = require_int(body, "streamId")?;
    let reason = require_int(body, "reason")?;
    if body.len() != 2 {
        return Err(WireError::Schema("unexpected member in close body"));
    }
    Ok(InboundMessage::Close(CloseEvent { stream_id, reason }))
}

pub fn encode_hello_response(id: i64) -> Bytes {
    let mut buf = BytesMut::new();
    let header = Value::Dict(vec![
        ("response".to_owned(), Value::String("hello".to_owned())),
        ("protocol".to_owned(), Value::String(PROTOCOL_CONTROL.to_owned())),
        ("id".to_owned(), Value::Int(id)),
    ]);
    value::encode(&header, &mut buf);
    value::encode(&Value::Dict(vec![("status".to_owned(), Value::Int(0))]), &mut buf);
    buf.freeze()
}

pub fn encode_open_response(id: i64) -> Bytes {
    let mut buf = BytesMut::new();
    let header = Value::Dict(vec![
        ("response".to_owned(), Value::String("open".to_owned())),
        ("protocol".to_owned(), Value::String(PROTOCOL_DATA_SEND.to_owned())),
        ("id".to_owned(), Value::Int(id)),
    ]);
    value::encode(&header, &mut buf);
    value::encode(&Value::Dict(vec![("status".to_owned(), Value::Int(0))]), &mut buf);
    buf.freeze()
}

/// Data event with a single chunk. The chunk blob keeps the fixed 32-bit
///  length form, so most of the body is assembled by hand instead of going
///  through the generic encoder.
pub fn encode_data_event(
    stream_id: i64,
    end_of_stream: bool,
    metadata: &ChunkMetadata,
    data: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 256);

    let header = Value::Dict(vec![
        ("protocol".to_owned(), Value::String(PROTOCOL_DATA_SEND.to_owned())),
        ("event".to_owned(), Value::String("data".to_owned())),
    ]);
    value::encode(&header, &mut buf);

    let body_members = if end_of_stream { 3 } else { 2 };
    value::encode_dict_header(body_members, &mut buf);
    value::encode_string("streamId", &mut buf);
    value::encode_int(stream_id, &mut buf);
    if end_of_stream {
        value::encode_string("endOfStream", &mut buf);
        value::encode(&Value::Bool(true), &mut buf);
    }
    value::encode_string("packets", &mut buf);
    value::encode_array_header(1, &mut buf);

    value::encode_dict_header(2, &mut buf);
    value::encode_string("metadata", &mut buf);
    let mut members = Vec::with_capacity(5);
    if let Some(total) = metadata.data_total_size {
        members.push(("dataTotalSize".to_owned(), Value::Int(total)));
    }
    members.push(("dataType".to_owned(), Value::String(metadata.data_type.to_owned())));
    members.push(("dataSequenceNumber".to_owned(), Value::Int(metadata.data_sequence_number)));
    members.push(("isLastDataChunk".to_owned(), Value::Bool(metadata.is_last_data_chunk)));
    members.push((
        "dataChunkSequenceNumber".to_owned(),
        Value::Int(metadata.data_chunk_sequence_number),
    ));
    value::encode(&Value::Dict(members), &mut buf);
    value::encode_string("data", &mut buf);
    value::encode_data_u32_len(data, &mut buf);

    buf.freeze()
}

pub fn encode_close_event(stream_id: i64, reason: i64) -> Bytes {
    let mut buf = BytesMut::new();
    let header = Value::Dict(vec![
        ("event".to_owned(), Value::String("close".to_owned())),
        ("protocol".to_owned(), Value::String(PROTOCOL_DATA_SEND.to_owned())),
    ]);
    value::encode(&header, &mut buf);
    let body = Value::Dict(vec![
        ("streamId".to_owned(), Value::Int(stream_id)),
        ("reason".to_owned(), Value::Int(reason)),
    ]);
    value::encode(&body, &mut buf);
    buf.freeze()
}

fn get<'d>(dict: &'d [(String, Value)], key: &str) -> Option<&'d Value> {
    dict.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn require_int(dict: &[(String, Value)], key: &'static str) -> Result<i64, WireError> {
    get(dict, key)
        .and_then(Value::as_int)
        .ok_or(WireError::Schema("missing or mistyped integer member"))
}

fn require_str<'d>(dict: &'d [(String, Value)], key: &'static str) -> Result<&'d str, WireError> {
    get(dict, key)
        .and_then(Value::as_str)
        .ok_or(WireError::Schema("missing or mistyped string member"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn encode_request(header: Value, body: Option<Value>) -> Vec<u8> {
        let mut buf = BytesMut::new();
        value::encode(&header, &mut buf);
        if let Some(body) = body {
            value::encode(&body, &mut buf);
        }
        buf.to_vec()
    }

    fn hello_header(id: i64) -> Value {
        Value::Dict(vec![
            ("request".to_owned(), Value::String("hello".to_owned())),
            ("protocol".to_owned(), Value::String("control".to_owned())),
            ("id".to_owned(), Value::Int(id)),
        ])
    }

    #[test]
    fn test_parse_hello() {
        let payload = encode_request(hello_header(17), None);
        assert_eq!(
            parse_inbound(&payload).unwrap(),
            InboundMessage::Hello(HelloRequest { id: 17 })
        );
    }

    #[test]
    fn test_parse_open_ignores_extra_keys() {
        let header = Value::Dict(vec![
            ("request".to_owned(), Value::String("open".to_owned())),
            ("protocol".to_owned(), Value::String("dataSend".to_owned())),
            ("id".to_owned(), Value::Int(2)),
        ]);
        let body = Value::Dict(vec![
            ("target".to_owned(), Value::String("controller".to_owned())),
            ("type".to_owned(), Value::String("ipcamera.recording".to_owned())),
            ("streamId".to_owned(), Value::Int(1)),
            ("futureKnob".to_owned(), Value::Bool(true)),
        ]);
        let payload = encode_request(header, Some(body));
        assert_eq!(
            parse_inbound(&payload).unwrap(),
            InboundMessage::Open(OpenRequest {
                id: 2,
                stream_kind: "ipcamera.recording".to_owned(),
                stream_id: 1,
            })
        );
    }

    #[test]
    fn test_parse_ack_and_close() {
        let ack_header = Value::Dict(vec![
            ("event".to_owned(), Value::String("ack".to_owned())),
            ("protocol".to_owned(), Value::String("dataSend".to_owned())),
        ]);
        let ack_body = Value::Dict(vec![
            ("streamId".to_owned(), Value::Int(1)),
            ("endOfStream".to_owned(), Value::Bool(true)),
        ]);
        let payload = encode_request(ack_header.clone(), Some(ack_body));
        assert_eq!(
            parse_inbound(&payload).unwrap(),
            InboundMessage::Ack(AckEvent { stream_id: 1, end_of_stream: Some(true) })
        );

        let close_header = Value::Dict(vec![
            ("event".to_owned(), Value::String("close".to_owned())),
            ("protocol".to_owned(), Value::String("dataSend".to_owned())),
        ]);
        let close_body = Value::Dict(vec![
            ("streamId".to_owned(), Value::Int(1)),
            ("reason".to_owned(), Value::Int(5)),
        ]);
        let payload = encode_request(close_header, Some(close_body));
        assert_eq!(
            parse_inbound(&payload).unwrap(),
            InboundMessage::Close(CloseEvent { stream_id: 1, reason: 5 })
        );
    }

    #[rstest]
    #[case::hello_with_extra_member(
        Value::Dict(vec![
            ("request".to_owned(), Value::String("hello".to_owned())),
            ("protocol".to_owned(), Value::String("control".to_owned())),
            ("id".to_owned(), Value::Int(1)),
            ("extra".to_owned(), Value::Int(1)),
        ]),
        None
    )]
    #[case::hello_with_body(
        hello_header(1),
        Some(Value::Dict(vec![("status".to_owned(), Value::Int(0))]))
    )]
    #[case::hello_wrong_protocol(
        Value::Dict(vec![
            ("request".to_owned(), Value::String("hello".to_owned())),
            ("protocol".to_owned(), Value::String("dataSend".to_owned())),
            ("id".to_owned(), Value::Int(1)),
        ]),
        None
    )]
    #[case::open_wrong_target(
        Value::Dict(vec![
            ("request".to_owned(), Value::String("open".to_owned())),
            ("protocol".to_owned(), Value::String("dataSend".to_owned())),
            ("id".to_owned(), Value::Int(1)),
        ]),
        Some(Value::Dict(vec![
            ("target".to_owned(), Value::String("accessory".to_owned())),
            ("type".to_owned(), Value::String("ipcamera.recording".to_owned())),
            ("streamId".to_owned(), Value::Int(1)),
        ]))
    )]
    #[case::ack_with_unknown_member(
        Value::Dict(vec![
            ("event".to_owned(), Value::String("ack".to_owned())),
            ("protocol".to_owned(), Value::String("dataSend".to_owned())),
        ]),
        Some(Value::Dict(vec![
            ("streamId".to_owned(), Value::Int(1)),
            ("bogus".to_owned(), Value::Int(1)),
        ]))
    )]
    #[case::close_missing_reason(
        Value::Dict(vec![
            ("event".to_owned(), Value::String("close".to_owned())),
            ("protocol".to_owned(), Value::String("dataSend".to_owned())),
        ]),
        Some(Value::Dict(vec![("streamId".to_owned(), Value::Int(1))]))
    )]
    #[case::mistyped_id(
        Value::Dict(vec![
            ("request".to_owned(), Value::String("hello".to_owned())),
            ("protocol".to_owned(), Value::String("control".to_owned())),
            ("id".to_owned(), Value::String("1".to_owned())),
        ]),
        None
    )]
    fn test_schema_violations_are_rejected(#[case] header: Value, #[case] body: Option<Value>) {
        let payload = encode_request(header, body);
        assert!(matches!(parse_inbound(&payload), Err(WireError::Schema(_))));
    }

    #[test]
    fn test_data_event_blob_always_u32_length() {
        let metadata = ChunkMetadata {
            data_total_size: Some(1000),
            data_type: DATA_TYPE_MEDIA_FRAGMENT,
            data_sequence_number: 2,
            is_last_data_chunk: false,
            data_chunk_sequence_number: 1,
        };
        let payload = encode_data_event(1, false, &metadata, b"xy");
        // a 2-byte blob would normally use the inline form; the chunk blob
        // must keep the explicit 32-bit length tag
        let needle = [0x93u8, 2, 0, 0, 0, b'x', b'y'];
        assert!(payload.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_responses_parse_as_two_dicts() {
        for payload in [encode_hello_response(9), encode_open_response(3)] {
            let mut reader = Reader::new(&payload);
            let header = reader.read_value().unwrap();
            let body = reader.read_value().unwrap();
            assert!(reader.is_empty());
            assert!(matches!(header, Value::Dict(_)));
            let body = body.as_dict().unwrap().to_vec();
            assert_eq!(body, vec![("status".to_owned(), Value::Int(0))]);
        }
    }
}
