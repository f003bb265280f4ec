// Open Ephys ZMQ interface messages: a JSON header frame, then for data
// messages a raw little-endian float32 payload frame.
use super::frame::{ChannelBlock, ChannelFragment};
use crate::error::StreamError;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
struct Header {
    message_num: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct DataContent {
    num_samples: usize,
    channel_num: usize,
    sample_num: i64,
    sample_rate: f64,
    stream: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Data(ChannelFragment),
    Event,
    Spike,
    Param(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub message_num: i64,
    pub body: MessageBody,
}

/// Decodes one multipart message. With `envelope_frame` the first part is
/// skipped.
pub fn parse_message(parts: &[Bytes], envelope_frame: bool) -> Result<StreamMessage, StreamError> {
    let offset = usize::from(envelope_frame);
    let header_bytes = parts
        .get(offset)
        .ok_or(StreamError::MissingFrames(parts.len()))?;

    let header: Header = serde_json::from_slice(header_bytes)
        .map_err(|e| StreamError::MalformedHeader(e.to_string()))?;

    let body = match header.kind.as_str() {
        "data" => {
            let content: DataContent = serde_json::from_value(header.content)
                .map_err(|e| StreamError::MalformedHeader(format!("data content: {}", e)))?;
            let payload = parts
                .get(offset + 1)
                .ok_or(StreamError::MissingFrames(parts.len()))?;
            MessageBody::Data(decode_data(content, header.timestamp, payload)?)
        }
        "event" => MessageBody::Event,
        "spike" => MessageBody::Spike,
        "param" => match header.content {
            Value::Object(map) => MessageBody::Param(map),
            other => {
                return Err(StreamError::MalformedHeader(format!(
                    "param content is not an object: {}",
                    other
                )))
            }
        },
        other => return Err(StreamError::UnknownMessageType(other.to_string())),
    };

    Ok(StreamMessage {
        message_num: header.message_num,
        body,
    })
}

fn decode_data(
    content: DataContent,
    timestamp: i64,
    payload: &[u8],
) -> Result<ChannelFragment, StreamError> {
    let expected = content.num_samples * std::mem::size_of::<f32>();
    if payload.len() != expected {
        return Err(StreamError::ShapeMismatch {
            expected,
            actual: payload.len(),
        });
    }

    let mut samples = vec![0f32; content.num_samples];
    LittleEndian::read_f32_into(payload, &mut samples);

    Ok(ChannelFragment {
        timestamp,
        sample_id: content.sample_num,
        block: ChannelBlock {
            channel_index: content.channel_num,
            sample_count: content.num_samples,
            sample_rate: content.sample_rate,
            stream_name: content.stream,
            samples,
        },
    })
}

/// Builds the parts of a data message, envelope first when requested.
pub fn encode_data_message(
    message_num: i64,
    fragment: &ChannelFragment,
    envelope_frame: bool,
) -> Vec<Bytes> {
    let header = serde_json::json!({
        "message_num": message_num,
        "type": "data",
        "content": {
            "stream": fragment.block.stream_name,
            "channel_num": fragment.block.channel_index,
            "num_samples": fragment.block.samples.len(),
            "sample_num": fragment.sample_id,
            "sample_rate": fragment.block.sample_rate,
        },
        "data_size": fragment.block.samples.len() * std::mem::size_of::<f32>(),
        "timestamp": fragment.timestamp,
    });

    let mut payload = vec![0u8; fragment.block.samples.len() * std::mem::size_of::<f32>()];
    LittleEndian::write_f32_into(&fragment.block.samples, &mut payload);

    let mut parts = Vec::with_capacity(3);
    if envelope_frame {
        parts.push(Bytes::from_static(b"data"));
    }
    parts.push(Bytes::from(header.to_string()));
    parts.push(Bytes::from(payload));
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(json: &str) -> Vec<Bytes> {
        vec![Bytes::from_static(b"data"), Bytes::from(json.to_string())]
    }

    #[test]
    fn data_message_decodes_channel_block() {
        let mut payload = Vec::new();
        for v in [1.5f32, -2.25, 3.0] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let mut parts = header(
            r#"{"message_num": 12, "type": "data", "timestamp": 9001,
                "content": {"stream": "example_data", "channel_num": 1,
                            "num_samples": 3, "sample_num": 4410, "sample_rate": 5000.0}}"#,
        );
        parts.push(Bytes::from(payload));

        let message = parse_message(&parts, true).unwrap();
        assert_eq!(message.message_num, 12);
        match message.body {
            MessageBody::Data(f) => {
                assert_eq!(f.timestamp, 9001);
                assert_eq!(f.sample_id, 4410);
                assert_eq!(f.block.channel_index, 1);
                assert_eq!(f.block.stream_name, "example_data");
                assert_eq!(f.block.samples, vec![1.5, -2.25, 3.0]);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn payload_length_must_match_sample_count() {
        let mut parts = header(
            r#"{"message_num": 1, "type": "data", "timestamp": 0,
                "content": {"stream": "s", "channel_num": 0,
                            "num_samples": 4, "sample_num": 0, "sample_rate": 5000.0}}"#,
        );
        parts.push(Bytes::from(vec![0u8; 12]));

        assert!(matches!(
            parse_message(&parts, true),
            Err(StreamError::ShapeMismatch { expected: 16, actual: 12 })
        ));
    }

    #[test]
    fn message_types_are_classified() {
        let event = header(r#"{"message_num": 2, "type": "event", "content": {}}"#);
        assert_eq!(parse_message(&event, true).unwrap().body, MessageBody::Event);

        let spike = header(r#"{"message_num": 3, "type": "spike"}"#);
        assert_eq!(parse_message(&spike, true).unwrap().body, MessageBody::Spike);

        let param = header(r#"{"message_num": 4, "type": "param", "content": {"gain": 2}}"#);
        match parse_message(&param, true).unwrap().body {
            MessageBody::Param(map) => assert_eq!(map["gain"], 2),
            other => panic!("unexpected body {:?}", other),
        }

        let unknown = header(r#"{"message_num": 5, "type": "telemetry"}"#);
        assert!(matches!(
            parse_message(&unknown, true),
            Err(StreamError::UnknownMessageType(t)) if t == "telemetry"
        ));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let parts = header("{not json");
        assert!(matches!(
            parse_message(&parts, true),
            Err(StreamError::MalformedHeader(_))
        ));
        assert!(matches!(
            parse_message(&[], false),
            Err(StreamError::MissingFrames(0))
        ));
    }

    #[test]
    fn encoded_message_parses_without_envelope() {
        let fragment = ChannelFragment {
            timestamp: 77,
            sample_id: 500,
            block: ChannelBlock {
                channel_index: 0,
                sample_count: 2,
                sample_rate: 5000.0,
                stream_name: "sim".to_string(),
                samples: vec![0.25, 0.5],
            },
        };
        let parts = encode_data_message(9, &fragment, false);
        assert_eq!(parts.len(), 2);

        let message = parse_message(&parts, false).unwrap();
        assert_eq!(message.body, MessageBody::Data(fragment));
    }
}
