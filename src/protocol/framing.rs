use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use super::DELIMITER;
use super::message::{ControlMessage, TransferHeader};
use crate::error::CoreError;

/// Escape marker inside frame payloads. `ESC 0x00` encodes a literal ESC,
/// `ESC 0x01` encodes a literal delimiter sequence.
const ESC: u8 = 0x1b;
const ESC_SELF: u8 = 0x00;
const ESC_DELIM: u8 = 0x01;

/// Upper bound on a single control frame. Anything larger means the stream
/// is not speaking this protocol.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Read buffer granularity for the frame scanner.
const READ_CHUNK: usize = 4096;

/// One decoded frame: either a structured control message or a transfer
/// header (raw file bytes follow the latter on the stream).
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlMessage),
    Header(TransferHeader),
}

/// Byte-stuff a payload so the frame delimiter cannot occur inside it.
/// Payloads free of ESC and the delimiter are passed through unchanged,
/// which keeps the wire compatible with the legacy sentinel encoding.
pub fn escape_payload(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    let mut i = 0;
    while i < payload.len() {
        if payload[i..].starts_with(DELIMITER) {
            out.push(ESC);
            out.push(ESC_DELIM);
            i += DELIMITER.len();
        } else if payload[i] == ESC {
            out.push(ESC);
            out.push(ESC_SELF);
            i += 1;
        } else {
            out.push(payload[i]);
            i += 1;
        }
    }
    out
}

/// Inverse of [`escape_payload`].
pub fn unescape_payload(data: &[u8]) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == ESC {
            match data.get(i + 1) {
                Some(&ESC_SELF) => out.push(ESC),
                Some(&ESC_DELIM) => out.extend_from_slice(DELIMITER),
                _ => return Err(CoreError::protocol("dangling escape in frame")),
            }
            i += 2;
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Encode a control message as a delimiter-terminated frame.
pub fn encode_control(msg: &ControlMessage) -> Result<Vec<u8>, CoreError> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| CoreError::protocol(format!("encode failed: {e}")))?;
    let mut frame = escape_payload(&payload);
    frame.extend_from_slice(DELIMITER);
    Ok(frame)
}

/// Encode a transfer header as a delimiter-terminated frame. The caller
/// streams the raw file bytes immediately after.
pub fn encode_header(header: &TransferHeader) -> Vec<u8> {
    let mut frame = escape_payload(header.encode().as_bytes());
    frame.extend_from_slice(DELIMITER);
    frame
}

/// Decode one raw frame body. Structured decode is attempted first; text
/// that is not a JSON control message is treated as a transfer header.
fn decode_frame(raw: &[u8]) -> Result<Frame, CoreError> {
    let payload = unescape_payload(raw)?;
    if let Ok(msg) = serde_json::from_slice::<ControlMessage>(&payload) {
        return Ok(Frame::Control(msg));
    }
    let text = std::str::from_utf8(&payload)
        .map_err(|_| CoreError::protocol("frame is not valid UTF-8"))?;
    TransferHeader::parse(text).map(Frame::Header)
}

/// Buffered frame decoder over one half of the peer stream.
///
/// Bytes read past a delimiter in the same read belong to the file payload
/// trailing a header; they stay buffered here and are served by
/// [`FrameReader::read_body`] before any further stream reads, so no byte is
/// dropped or double-counted.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Read and decode the next frame. Each stream read waits at most
    /// `timeout`; a timeout with no data is retried, it is not an error.
    pub async fn read_frame(&mut self, timeout: Duration) -> Result<Frame, CoreError> {
        loop {
            if let Some(pos) = find_delimiter(&self.buf) {
                let raw: Vec<u8> = self.buf.drain(..pos + DELIMITER.len()).collect();
                return decode_frame(&raw[..pos]);
            }
            if self.buf.len() > MAX_FRAME_LEN {
                return Err(CoreError::protocol("frame exceeds maximum length"));
            }

            let mut chunk = [0u8; READ_CHUNK];
            match tokio::time::timeout(timeout, self.reader.read(&mut chunk)).await {
                Err(_) => {
                    trace!("frame read timed out with no data, retrying");
                    continue;
                }
                Ok(Ok(0)) => {
                    return Err(CoreError::Connection(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    )));
                }
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(CoreError::Connection(e)),
            }
        }
    }

    /// Read raw body bytes trailing a header. Buffered bytes are served
    /// first. Returns 0 only when the peer closed the stream.
    pub async fn read_body(
        &mut self,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, CoreError> {
        if !self.buf.is_empty() {
            let n = out.len().min(self.buf.len());
            out[..n].copy_from_slice(&self.buf[..n]);
            self.buf.drain(..n);
            return Ok(n);
        }
        loop {
            match tokio::time::timeout(timeout, self.reader.read(out)).await {
                Err(_) => {
                    trace!("body read timed out with no data, retrying");
                    continue;
                }
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) => return Err(CoreError::Connection(e)),
            }
        }
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(DELIMITER.len()).position(|w| w == DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_passthrough_for_clean_payloads() {
        let payload = br#"{"type":"list_request"}"#;
        assert_eq!(escape_payload(payload), payload);
    }

    #[test]
    fn test_escape_roundtrip_with_sentinel_inside() {
        let payload = b"weird<<END>>name.txt|10|/tmp";
        let escaped = escape_payload(payload);
        assert!(find_delimiter(&escaped).is_none());
        assert_eq!(unescape_payload(&escaped).unwrap(), payload);
    }

    #[test]
    fn test_escape_roundtrip_with_esc_byte() {
        let payload = [b'a', ESC, b'b', ESC, ESC];
        let escaped = escape_payload(&payload);
        assert_eq!(unescape_payload(&escaped).unwrap(), payload);
    }

    #[test]
    fn test_dangling_escape_rejected() {
        assert!(unescape_payload(&[b'a', ESC]).is_err());
        assert!(unescape_payload(&[ESC, 0x7f]).is_err());
    }

    #[test]
    fn test_decode_prefers_control_then_header() {
        let control = decode_frame(br#"{"type":"list_request"}"#).unwrap();
        assert!(matches!(control, Frame::Control(_)));

        let header = decode_frame(b"a.bin|10|/tmp|cafe").unwrap();
        match header {
            Frame::Header(h) => assert_eq!(h.size, 10),
            other => panic!("expected header, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage_is_protocol_error() {
        assert!(decode_frame(b"not json and not a header").is_err());
        assert!(decode_frame(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[tokio::test]
    async fn test_read_frame_and_trailing_body() {
        let timeout = Duration::from_secs(5);
        let (client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);

        let mut wire = encode_header(&TransferHeader {
            name: "a.bin".into(),
            size: 5,
            dest_dir: "/tmp".into(),
            checksum: None,
        });
        wire.extend_from_slice(b"hello");

        let (_r, mut w) = tokio::io::split(client);
        tokio::io::AsyncWriteExt::write_all(&mut w, &wire).await.unwrap();

        let frame = reader.read_frame(timeout).await.unwrap();
        assert!(matches!(frame, Frame::Header(ref h) if h.name == "a.bin"));

        // The body bytes arrived in the same read buffer as the header.
        let mut body = [0u8; 5];
        let mut got = 0;
        while got < body.len() {
            let n = reader.read_body(&mut body[got..], timeout).await.unwrap();
            assert!(n > 0);
            got += n;
        }
        assert_eq!(&body, b"hello");
    }

    #[tokio::test]
    async fn test_read_frame_across_split_writes() {
        let timeout = Duration::from_secs(5);
        let (client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        let frame = encode_control(&ControlMessage::ListRequest {
            path: Some("/srv/data".into()),
        })
        .unwrap();

        let (_r, mut w) = tokio::io::split(client);
        let (first, rest) = frame.split_at(7);
        let first = first.to_vec();
        let rest = rest.to_vec();
        let writer = tokio::spawn(async move {
            tokio::io::AsyncWriteExt::write_all(&mut w, &first).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::io::AsyncWriteExt::write_all(&mut w, &rest).await.unwrap();
        });

        let decoded = reader.read_frame(timeout).await.unwrap();
        assert_eq!(
            decoded,
            Frame::Control(ControlMessage::ListRequest {
                path: Some("/srv/data".into())
            })
        );
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_is_connection_error() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        drop(client);
        let err = reader.read_frame(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_connection_fatal());
    }
}
