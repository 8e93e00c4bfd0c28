//! Incremental decoding of `data:`-framed event streams
//!
//! Events are separated by a blank line. Inside an event, only lines that
//! start with `data:` contribute to the payload; everything else (comments,
//! `event:` and `id:` fields) is skipped. Payloads are JSON values.

use futures::{Stream, StreamExt};
use serde_json::Value;

/// Field prefix carrying an event payload
pub const DATA_PREFIX: &str = "data:";

const DELIMITER: &[u8] = b"\n\n";

/// Buffers raw chunks and splits them into decoded event payloads.
///
/// Chunk boundaries never affect the output: feeding the same bytes in any
/// split produces the same payloads in the same order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Offset below which the buffer is known to hold no delimiter
    scanned: usize,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every payload completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        // Carriage returns are dropped so `\r\n\r\n` delimits like `\n\n`.
        self.buffer
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(pos) = find_delimiter(&self.buffer, self.scanned) {
            let event: Vec<u8> = self.buffer.drain(..pos + DELIMITER.len()).collect();
            self.scanned = 0;
            if let Some(value) = decode_event(&event[..pos]) {
                payloads.push(value);
            }
        }
        self.scanned = self.buffer.len().saturating_sub(DELIMITER.len() - 1);
        payloads
    }

    /// Number of bytes waiting for a delimiter
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// End the stream, discarding any unterminated remainder.
    ///
    /// Returns how many bytes were dropped.
    pub fn finish(self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            tracing::debug!("Discarding {} bytes of unterminated event data", dropped);
        }
        dropped
    }
}

fn find_delimiter(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(DELIMITER.len())
        .position(|w| w == DELIMITER)
        .map(|p| p + from)
}

/// Decode one event body. Malformed payloads are logged and skipped.
fn decode_event(event: &[u8]) -> Option<Value> {
    let text = match std::str::from_utf8(event) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!("Skipping event with invalid UTF-8: {}", e);
            return None;
        }
    };

    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.trim().strip_prefix(DATA_PREFIX))
        .map(str::trim_start)
        .collect();
    if data.is_empty() {
        return None;
    }

    let joined = data.join("\n");
    match serde_json::from_str(&joined) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("Skipping malformed event payload {:?}: {}", joined, e);
            None
        }
    }
}

/// Decode a stream of raw chunks into a stream of payloads.
///
/// A transport error is passed through and ends the stream; whatever was
/// buffered at that point is discarded along with it.
pub fn decode_stream<S, B, E>(chunks: S) -> impl Stream<Item = Result<Value, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    async_stream::stream! {
        let mut decoder = FrameDecoder::new();
        let mut chunks = std::pin::pin!(chunks);

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    for value in decoder.push(bytes.as_ref()) {
                        yield Ok(value);
                    }
                }
                Err(e) => {
                    decoder.finish();
                    yield Err(e);
                    return;
                }
            }
        }

        decoder.finish();
    }
}

/// Encode a payload as one complete frame
pub fn encode_frame(value: &Value) -> String {
    format!("{} {}\n\n", DATA_PREFIX, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;
    use serde_json::json;

    fn decode_strs(chunks: &[&str]) -> Vec<Value> {
        let bytes: Vec<&[u8]> = chunks.iter().map(|c| c.as_bytes()).collect();
        decode_all(&bytes)
    }

    fn decode_all(chunks: &[&[u8]]) -> Vec<Value> {
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.push(chunk));
        }
        out
    }

    #[test]
    fn test_single_event() {
        let out = decode_strs(&["data: {\"delta\":\"Hi\"}\n\n"]);
        assert_eq!(out, vec![json!({"delta": "Hi"})]);
    }

    #[test]
    fn test_prefix_without_space() {
        let out = decode_strs(&["data:{\"done\":true}\n\n"]);
        assert_eq!(out, vec![json!({"done": true})]);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let out = decode_strs(&["da", "ta: {\"delta\":", "\"Hi\"}\n", "\n"]);
        assert_eq!(out, vec![json!({"delta": "Hi"})]);
    }

    #[test]
    fn test_multiple_events_in_one_chunk() {
        let out = decode_strs(&["data: 1\n\ndata: 2\n\ndata: 3\n\n"]);
        assert_eq!(out, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_crlf_delimiters() {
        let out = decode_strs(&["data: {\"a\":1}\r\n\r\ndata: {\"a\":2}\r\n", "\r\n"]);
        assert_eq!(out, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[test]
    fn test_non_data_lines_ignored() {
        let out = decode_strs(&[": keep-alive\n\nevent: message\nid: 7\ndata: {\"delta\":\"x\"}\n\n"]);
        assert_eq!(out, vec![json!({"delta": "x"})]);
    }

    #[test]
    fn test_malformed_payload_skipped() {
        let out = decode_strs(&["data: {not json\n\ndata: {\"delta\":\"ok\"}\n\n"]);
        assert_eq!(out, vec![json!({"delta": "ok"})]);
    }

    #[test]
    fn test_multiline_data_joined() {
        let out = decode_strs(&["data: {\"delta\":\ndata: \"joined\"}\n\n"]);
        assert_eq!(out, vec![json!({"delta": "joined"})]);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let frame = "data: {\"delta\":\"héllo ✓\"}\n\n".as_bytes();
        let split = frame.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let out = decode_all(&[&frame[..split], &frame[split..]]);
        assert_eq!(out, vec![json!({"delta": "héllo ✓"})]);
    }

    #[test]
    fn test_trailing_remainder_discarded() {
        let mut decoder = FrameDecoder::new();
        let out = decoder.push(b"data: {\"delta\":\"a\"}\n\ndata: {\"delta\":\"b\"}");
        assert_eq!(out, vec![json!({"delta": "a"})]);
        assert_eq!(decoder.buffered(), "data: {\"delta\":\"b\"}".len());
        assert_eq!(decoder.finish(), "data: {\"delta\":\"b\"}".len());
    }

    #[test]
    fn test_encode_frame_decodes() {
        let value = json!({"delta": "line\nbreak"});
        let out = decode_strs(&[&encode_frame(&value)]);
        assert_eq!(out, vec![value]);
    }

    #[tokio::test]
    async fn test_decode_stream_passes_error_and_stops() {
        let chunks = futures::stream::iter(vec![
            Ok::<_, String>(b"data: 1\n\ndata: 2".to_vec()),
            Err("connection reset".to_string()),
            Ok(b"\n\ndata: 3\n\n".to_vec()),
        ]);
        let items: Vec<_> = decode_stream(chunks).collect().await;
        assert_eq!(items, vec![Ok(json!(1)), Err("connection reset".to_string())]);
    }

    #[tokio::test]
    async fn test_decode_stream_ends_with_transport() {
        let chunks = futures::stream::iter(vec![
            Ok::<_, String>(Bytes::from_static(b"data: {\"delta\":\"Hi\"}\n")),
            Ok(Bytes::from_static(b"\ndata: {\"done\":true}\n\n")),
        ]);
        let items: Vec<_> = decode_stream(chunks).collect().await;
        assert_eq!(
            items,
            vec![Ok(json!({"delta": "Hi"})), Ok(json!({"done": true}))]
        );
    }

    fn arb_event() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-zA-Z0-9 ]{0,12}".prop_map(|s| encode_frame(&json!({ "delta": s }))),
            Just(encode_frame(&json!({"done": true}))),
            Just(": comment\n\n".to_string()),
            Just("data: {broken\n\n".to_string()),
            Just("event: ping\r\ndata: \"é\"\r\n\r\n".to_string()),
        ]
    }

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_matter(
            events in proptest::collection::vec(arb_event(), 0..12),
            tail in "[a-z: ]{0,8}",
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..16),
        ) {
            let stream = format!("{}{}", events.concat(), tail);
            let bytes = stream.as_bytes();

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut start = 0;
            for point in points {
                chunks.push(&bytes[start..point]);
                start = point;
            }
            chunks.push(&bytes[start..]);

            prop_assert_eq!(decode_all(&chunks), decode_all(&[bytes]));
        }
    }
}
