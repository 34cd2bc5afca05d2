use crate::error::ProtocolError;
use crate::models::ChunkMetadata;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    LoadDocument {
        #[serde(rename = "filePath")]
        file_path: String,
    },
    Query {
        question: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub content: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    DocumentLoaded {
        #[serde(rename = "filePath")]
        file_path: String,
        #[serde(rename = "numChunks")]
        num_chunks: usize,
    },
    Token {
        content: String,
        timestamp: i64,
    },
    FinalAnswer {
        answer: String,
        sources: Vec<SourceDocument>,
    },
    Error {
        error: String,
        timestamp: i64,
    },
}

impl Response {
    pub fn token(content: impl Into<String>) -> Self {
        Self::Token {
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

// One JSON object per line. A trailing partial line stays buffered until the
// rest of it arrives, so decoding does not depend on read chunk boundaries.
#[derive(Debug, Default)]
pub struct LineCodec {
    buffer: Vec<u8>,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        Ok(line)
    }

    // Blank lines are skipped; the worker is allowed to emit them.
    pub fn feed<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> Vec<Result<T, ProtocolError>> {
        self.buffer.extend_from_slice(bytes);

        let mut decoded = Vec::new();
        while let Some(end) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line[..end]);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }

            decoded.push(
                serde_json::from_str(trimmed)
                    .map_err(|error| ProtocolError::Decode(format!("{error}: {trimmed}"))),
            );
        }

        decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(
            LineCodec::encode(&Request::LoadDocument {
                file_path: "/tmp/manual.pdf".to_string(),
            })
            .unwrap(),
        );
        bytes.extend(
            LineCodec::encode(&Request::Query {
                question: "what is the torque spec?".to_string(),
            })
            .unwrap(),
        );
        bytes.extend(
            LineCodec::encode(&Request::Query {
                question: "multi\nline\nquestion".to_string(),
            })
            .unwrap(),
        );
        bytes
    }

    fn decode_all(codec: &mut LineCodec, bytes: &[u8]) -> (Vec<Request>, usize) {
        let mut requests = Vec::new();
        let mut failures = 0;
        for item in codec.feed::<Request>(bytes) {
            match item {
                Ok(request) => requests.push(request),
                Err(_) => failures += 1,
            }
        }
        (requests, failures)
    }

    #[test]
    fn encode_appends_exactly_one_newline() {
        let line = LineCodec::encode(&Request::Query {
            question: "a".to_string(),
        })
        .unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|&&byte| byte == b'\n').count(), 1);
    }

    #[test]
    fn newlines_in_payloads_are_escaped() {
        let line = LineCodec::encode(&Response::token("a\nb")).unwrap();
        // only the terminator itself is a literal newline
        assert_eq!(line.iter().filter(|&&byte| byte == b'\n').count(), 1);
    }

    #[test]
    fn decoding_is_independent_of_chunk_boundaries() {
        let stream = sample_stream();

        let mut whole = LineCodec::new();
        let (expected, expected_failures) = decode_all(&mut whole, &stream);
        assert_eq!(expected.len(), 3);
        assert_eq!(expected_failures, 0);

        for split in 0..=stream.len() {
            let mut codec = LineCodec::new();
            let (mut requests, mut failures) = decode_all(&mut codec, &stream[..split]);
            let (tail, tail_failures) = decode_all(&mut codec, &stream[split..]);
            requests.extend(tail);
            failures += tail_failures;

            assert_eq!(requests, expected, "split at byte {split}");
            assert_eq!(failures, 0, "split at byte {split}");
        }
    }

    #[test]
    fn byte_at_a_time_delivery_decodes_identically() {
        let stream = sample_stream();
        let mut codec = LineCodec::new();
        let mut requests = Vec::new();
        for byte in &stream {
            let (decoded, failures) = decode_all(&mut codec, std::slice::from_ref(byte));
            assert_eq!(failures, 0);
            requests.extend(decoded);
        }
        assert_eq!(requests.len(), 3);
    }

    #[test]
    fn malformed_line_fails_alone_and_stream_continues() {
        let stream =
            b"{\"type\":\"query\",\"question\":\"a\"}\n{bad json\n{\"type\":\"query\",\"question\":\"b\"}\n";
        let mut codec = LineCodec::new();
        let (requests, failures) = decode_all(&mut codec, stream);

        assert_eq!(failures, 1);
        assert_eq!(
            requests,
            vec![
                Request::Query {
                    question: "a".to_string()
                },
                Request::Query {
                    question: "b".to_string()
                },
            ]
        );
    }

    #[test]
    fn blank_lines_between_messages_are_skipped() {
        let mut codec = LineCodec::new();
        let (requests, failures) =
            decode_all(&mut codec, b"\n\n{\"type\":\"query\",\"question\":\"a\"}\n\n");
        assert_eq!(failures, 0);
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn response_wire_format_matches_contract() {
        let line = LineCodec::encode(&Response::DocumentLoaded {
            file_path: "/tmp/a.md".to_string(),
            num_chunks: 4,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(value["type"], "document_loaded");
        assert_eq!(value["filePath"], "/tmp/a.md");
        assert_eq!(value["numChunks"], 4);
    }
}
