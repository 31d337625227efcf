//! Incremental framing of the worker's response body.
//!
//! The body is a stream of newline-terminated lines. Only lines starting with
//! [`DATA_PREFIX`] carry a record; everything else (blank keep-alives, other
//! event-stream fields) is dropped. Chunk boundaries carry no meaning: bytes are
//! accumulated in a single carry-over buffer and only complete lines are decoded,
//! so a multi-byte character split across two chunks is reassembled before UTF-8
//! decoding.

use crate::error::SessionError;
use crate::model::{Frame, FrameKind, KeywordCount};
use serde::Deserialize;

pub const DATA_PREFIX: &[u8] = b"data: ";

/// Fallback reason for an `error` frame that carries no message.
pub const DEFAULT_ERROR_MESSAGE: &str = "worker reported an error";

pub type Decoded = Result<Frame, SessionError>;

/// Carry-over buffer for one session.
///
/// Decoding stops at the first terminal frame or the first malformed record;
/// input after that point is ignored.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: Vec<u8>,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one transport chunk and decode every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.carry.extend_from_slice(chunk);
        let Some(last_newline) = self.carry.iter().rposition(|b| *b == b'\n') else {
            return out;
        };
        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);
        // `complete` ends with '\n', so the final split piece is always empty.
        for line in complete[..complete.len() - 1].split(|b| *b == b'\n') {
            if self.decode_into(line, &mut out) {
                break;
            }
        }
        if self.finished {
            self.carry.clear();
        }
        out
    }

    /// Flush the unterminated fragment left when the body ends.
    pub fn finish(&mut self) -> Vec<Decoded> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        let line = std::mem::take(&mut self.carry);
        if !line.is_empty() {
            self.decode_into(&line, &mut out);
        }
        out
    }

    /// True once a terminal frame or a decode failure has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    // Returns true when decoding must stop.
    fn decode_into(&mut self, line: &[u8], out: &mut Vec<Decoded>) -> bool {
        let Some(item) = decode_line(line) else {
            return false;
        };
        let stop = match &item {
            Ok(frame) => frame.is_terminal(),
            Err(_) => true,
        };
        out.push(item);
        if stop {
            self.finished = true;
        }
        stop
    }
}

/// Decode one complete line. `None` means the line carries no record.
pub fn decode_line(line: &[u8]) -> Option<Decoded> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let payload = line.strip_prefix(DATA_PREFIX)?;
    Some(parse_payload(payload))
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: FrameKind,
    processed: Option<u64>,
    total: Option<u64>,
    keywords: Option<Vec<KeywordCount>>,
    message: Option<String>,
}

/// Parse the JSON payload of a `data: ` line into a [`Frame`].
pub fn parse_payload(payload: &[u8]) -> Decoded {
    let text = std::str::from_utf8(payload)
        .map_err(|e| SessionError::Protocol(format!("frame payload is not valid UTF-8: {e}")))?;
    let wire: WireFrame = serde_json::from_str(text)
        .map_err(|e| SessionError::Protocol(format!("malformed frame payload: {e}")))?;

    match wire.kind {
        FrameKind::Error => Ok(Frame {
            kind: FrameKind::Error,
            processed: wire.processed.unwrap_or(0),
            total: wire.total.unwrap_or(0),
            keywords: wire.keywords.unwrap_or_default(),
            message: Some(
                wire.message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
            ),
        }),
        kind => {
            let name = if kind == FrameKind::Progress {
                "progress"
            } else {
                "done"
            };
            let missing = |field: &str| {
                SessionError::Protocol(format!("{name} frame is missing `{field}`"))
            };
            Ok(Frame {
                kind,
                processed: wire.processed.ok_or_else(|| missing("processed"))?,
                total: wire.total.ok_or_else(|| missing("total"))?,
                keywords: wire.keywords.ok_or_else(|| missing("keywords"))?,
                message: wire.message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = concat!(
        "data: {\"type\":\"progress\",\"processed\":2,\"total\":4,\"keywords\":[[\"丹\",5]]}\n",
        "\n",
        "data: {\"type\":\"done\",\"processed\":4,\"total\":4,\"keywords\":[[\"丹\",5],[\"道\",2]]}\n",
        "\n",
    );

    fn decode_all(chunks: &[&[u8]]) -> Vec<Decoded> {
        let mut d = FrameDecoder::new();
        let mut out = Vec::new();
        for c in chunks {
            out.extend(d.feed(c));
        }
        out.extend(d.finish());
        out
    }

    // Split `bytes` at every position in `cuts` (sorted, in range).
    fn split_at<'a>(bytes: &'a [u8], cuts: &[usize]) -> Vec<&'a [u8]> {
        let mut pieces = Vec::new();
        let mut start = 0;
        for &c in cuts {
            pieces.push(&bytes[start..c]);
            start = c;
        }
        pieces.push(&bytes[start..]);
        pieces
    }

    #[test]
    fn decodes_worked_example() {
        let frames = decode_all(&[SAMPLE.as_bytes()]);
        assert_eq!(
            frames,
            vec![
                Ok(Frame::progress(2, 4, vec![KeywordCount::new("丹", 5)])),
                Ok(Frame::done(
                    4,
                    4,
                    vec![KeywordCount::new("丹", 5), KeywordCount::new("道", 2)]
                )),
            ]
        );
    }

    #[test]
    fn chunking_does_not_change_the_frame_sequence() {
        let bytes = SAMPLE.as_bytes();
        let whole = decode_all(&[bytes]);

        let single_bytes: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_all(&single_bytes), whole);

        for size in [2, 3, 5, 7, 13, 64] {
            let pieces: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(decode_all(&pieces), whole, "chunk size {size}");
        }

        // Cut inside the prefix, inside the multi-byte character and right before '\n'.
        let han = SAMPLE.find('丹').unwrap();
        let first_newline = SAMPLE.find('\n').unwrap();
        let pieces = split_at(bytes, &[3, han + 1, han + 2, first_newline]);
        assert_eq!(decode_all(&pieces), whole);
    }

    #[test]
    fn malformed_payload_fails_identically_however_it_is_split() {
        let stream = "data: {\"type\":\"progress\",\"processed\":1,\"total\":2,\"keywords\":[]}\n\
                      data: {\"type\":\"progress\",\"processed\":oops}\n\
                      data: {\"type\":\"done\",\"processed\":2,\"total\":2,\"keywords\":[]}\n";
        let bytes = stream.as_bytes();
        let whole = decode_all(&[bytes]);
        assert_eq!(whole.len(), 2);
        assert!(whole[0].is_ok());
        assert!(matches!(&whole[1], Err(SessionError::Protocol(_))));

        for size in 1..=9 {
            let pieces: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(decode_all(&pieces), whole, "chunk size {size}");
        }
    }

    #[test]
    fn ignores_unprefixed_lines_and_accepts_crlf() {
        let stream = ": keep-alive\r\n\r\nevent: update\r\nid: 7\r\n\
                      data: {\"type\":\"done\",\"processed\":0,\"total\":0,\"keywords\":[]}\r\n\r\n";
        let frames = decode_all(&[stream.as_bytes()]);
        assert_eq!(frames, vec![Ok(Frame::done(0, 0, vec![]))]);
    }

    #[test]
    fn holds_back_incomplete_line() {
        let mut d = FrameDecoder::new();
        assert!(d.feed(b"data: {\"type\":\"done\"").is_empty());
        assert_eq!(d.pending(), 20);
        let out = d.feed(b",\"processed\":1,\"total\":1,\"keywords\":[]}\n");
        assert_eq!(out, vec![Ok(Frame::done(1, 1, vec![]))]);
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn stops_after_terminal_frame() {
        let mut d = FrameDecoder::new();
        let out = d.feed(
            b"data: {\"type\":\"error\",\"message\":\"boom\"}\n\
              data: {\"type\":\"progress\",\"processed\":1,\"total\":1,\"keywords\":[]}\n",
        );
        assert_eq!(out, vec![Ok(Frame::error("boom"))]);
        assert!(d.is_finished());
        assert!(d
            .feed(b"data: {\"type\":\"done\",\"processed\":1,\"total\":1,\"keywords\":[]}\n")
            .is_empty());
        assert!(d.finish().is_empty());
    }

    #[test]
    fn error_frame_without_counters_or_message() {
        assert_eq!(
            parse_payload(br#"{"type":"error"}"#),
            Ok(Frame::error(DEFAULT_ERROR_MESSAGE))
        );
        assert_eq!(
            parse_payload(br#"{"type":"error","message":"file not found"}"#),
            Ok(Frame::error("file not found"))
        );
    }

    #[test]
    fn unexpected_shapes_are_protocol_errors() {
        for payload in [
            &br#"{"type":"progress","processed":1,"total":2}"#[..],
            br#"{"type":"progress","processed":"1","total":2,"keywords":[]}"#,
            br#"{"type":"progress","processed":-1,"total":2,"keywords":[]}"#,
            br#"{"type":"done","processed":1,"total":2,"keywords":[["a"]]}"#,
            br#"{"type":"done","processed":1,"total":2,"keywords":[{"a":1}]}"#,
            br#"{"type":"finished","processed":1,"total":2,"keywords":[]}"#,
            br#"[1,2,3]"#,
            b"\xff\xfe",
            b"",
        ] {
            let res = parse_payload(payload);
            assert!(
                matches!(res, Err(SessionError::Protocol(_))),
                "payload {:?} gave {res:?}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn trailing_fragment_is_decoded_at_end_of_body() {
        let mut d = FrameDecoder::new();
        assert!(d
            .feed(b"data: {\"type\":\"done\",\"processed\":3,\"total\":3,\"keywords\":[]}")
            .is_empty());
        assert_eq!(d.finish(), vec![Ok(Frame::done(3, 3, vec![]))]);
    }
}
