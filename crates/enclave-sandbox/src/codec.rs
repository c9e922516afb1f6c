//! Length-prefixed frame codec for process isolation.
//!
//! A frame is a 4-byte big-endian body length followed by the JSON encoding
//! of one [`Envelope`].  The worker side uses the blocking
//! [`read_frame`]/[`write_frame`] pair over its stdin/stdout; the supervisor
//! uses the async variants over the child's pipes.

use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SandboxError};
use crate::protocol::{self, Envelope, ErrorPayload, MessageType};
use crate::runtime::EnvelopeSink;

/// Largest frame body accepted in either direction.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Longest message kept when an oversized error envelope is shrunk.
const SHRUNK_MESSAGE_LEN: usize = 4096;

/// Encode one envelope as a complete frame (header + body).
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(envelope)
        .map_err(|e| SandboxError::Protocol(format!("failed to encode envelope: {e}")))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(SandboxError::Protocol(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            body.len()
        )));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn body_len(header: [u8; HEADER_LEN]) -> Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SandboxError::Protocol(format!(
            "incoming frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    Ok(len)
}

fn decode_body(body: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(body)
        .map_err(|e| SandboxError::Protocol(format!("malformed envelope: {e}")))
}

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    writer.write_all(&encode_frame(envelope)?)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.  Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut body = vec![0u8; body_len(header)?];
    reader.read_exact(&mut body)?;
    decode_body(&body).map(Some)
}

/// Async counterpart of [`write_frame`].
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    writer.write_all(&encode_frame(envelope)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Async counterpart of [`read_frame`].
pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut body = vec![0u8; body_len(header)?];
    reader.read_exact(&mut body).await?;
    decode_body(&body).map(Some)
}

/// An [`EnvelopeSink`] writing frames to a shared blocking writer (the
/// worker process's stdout).
pub struct FrameSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> FrameSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

/// Replacement for a call's answer that does not fit in a frame, so the
/// call still settles with an error instead of being lost.
fn shrink_answer(envelope: &Envelope, reason: &SandboxError) -> Option<Envelope> {
    let payload = match envelope.kind {
        MessageType::Response => ErrorPayload::new(
            protocol::ErrorKind::Execution,
            format!("result exceeds the frame limit: {reason}"),
        ),
        MessageType::Error => {
            let original: ErrorPayload = envelope.decode().ok()?;
            let mut message = original.message;
            if message.len() > SHRUNK_MESSAGE_LEN {
                let cut = (0..=SHRUNK_MESSAGE_LEN)
                    .rev()
                    .find(|&i| message.is_char_boundary(i))
                    .unwrap_or(0);
                message.truncate(cut);
            }
            ErrorPayload::new(original.kind, message)
        }
        _ => return None,
    };
    Some(Envelope::error(envelope.id.clone(), payload))
}

impl<W: Write + Send> EnvelopeSink for FrameSink<W> {
    fn send(&self, envelope: Envelope) -> bool {
        let frame = match encode_frame(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(id = %envelope.id, kind = ?envelope.kind, error = %e, "envelope does not fit in a frame");
                let Some(frame) = shrink_answer(&envelope, &e).and_then(|shrunk| encode_frame(&shrunk).ok())
                else {
                    return false;
                };
                frame
            }
        };
        let Ok(mut writer) = self.writer.lock() else {
            return false;
        };
        match writer.write_all(&frame).and_then(|()| writer.flush()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to write frame to host");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::*;
    use crate::protocol::{LogLevel, MessageType};

    #[test]
    fn frames_are_length_prefixed() {
        let env = Envelope::response("r1", json!(5));
        let frame = encode_frame(&env).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - HEADER_LEN);
    }

    #[test]
    fn reads_consecutive_frames_then_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Envelope::ready(vec!["add".into()])).unwrap();
        write_frame(&mut buf, &Envelope::console(LogLevel::Info, vec![json!("hi")])).unwrap();

        let mut cursor = Cursor::new(buf);
        let first = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(first.kind, MessageType::Ready);
        let second = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(second.kind, MessageType::Console);
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut bytes = ((MAX_FRAME_LEN as u32) + 1).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        let err = read_frame(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SandboxError::Protocol(_)));
    }

    #[test]
    fn garbage_body_is_protocol_error() {
        let mut bytes = 3u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"abc");
        let err = read_frame(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SandboxError::Protocol(_)));
    }

    #[test]
    fn truncated_body_is_io_error() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        let err = read_frame(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SandboxError::Io(_)));
    }

    #[tokio::test]
    async fn async_reader_understands_blocking_writer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Envelope::shutdown()).unwrap();
        let mut slice = buf.as_slice();
        let env = read_frame_async(&mut slice).await.unwrap().unwrap();
        assert_eq!(env.kind, MessageType::Shutdown);
        assert!(read_frame_async(&mut slice).await.unwrap().is_none());
    }

    #[test]
    fn frame_sink_writes_frames() {
        let sink = FrameSink::new(Vec::new());
        assert!(sink.send(Envelope::response("a", json!(null))));
        let buf = sink.writer.into_inner().unwrap();
        let env = read_frame(&mut Cursor::new(buf)).unwrap().unwrap();
        assert_eq!(env.id, "a");
    }

    #[test]
    fn oversized_response_is_answered_with_an_error() {
        let sink = FrameSink::new(Vec::new());
        let big = json!("a".repeat(MAX_FRAME_LEN));
        assert!(sink.send(Envelope::response("c7", big)));

        let buf = sink.writer.into_inner().unwrap();
        let mut cursor = Cursor::new(buf);
        let env = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(env.kind, MessageType::Error);
        assert_eq!(env.id, "c7");
        let payload: ErrorPayload = env.decode().unwrap();
        assert_eq!(payload.kind, protocol::ErrorKind::Execution);
        assert!(payload.message.contains("frame limit"), "{}", payload.message);
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn oversized_error_keeps_its_kind_with_a_short_message() {
        let sink = FrameSink::new(Vec::new());
        let payload = ErrorPayload::new(protocol::ErrorKind::Execution, "é".repeat(MAX_FRAME_LEN))
            .with_stack(Some("0: func[3]".into()));
        assert!(sink.send(Envelope::error("c8", payload)));

        let buf = sink.writer.into_inner().unwrap();
        let env = read_frame(&mut Cursor::new(buf)).unwrap().unwrap();
        assert_eq!(env.id, "c8");
        let payload: ErrorPayload = env.decode().unwrap();
        assert_eq!(payload.kind, protocol::ErrorKind::Execution);
        assert!(payload.message.len() <= SHRUNK_MESSAGE_LEN);
        assert!(payload.message.starts_with('é'));
        assert!(payload.stack.is_none());
    }

    #[test]
    fn oversized_console_line_is_dropped() {
        let sink = FrameSink::new(Vec::new());
        let line = json!("a".repeat(MAX_FRAME_LEN));
        assert!(!sink.send(Envelope::console(LogLevel::Info, vec![line])));
        assert!(sink.writer.into_inner().unwrap().is_empty());
    }
}
