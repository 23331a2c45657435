use crate::error::Error;

use bytes::{Buf, BufMut, BytesMut};
use mbus_api::{Frame, FrameCommand, Headers};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16MB by default).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Header carrying the body length.
pub const CONTENT_LENGTH_HEADER: &str = "content-length";

const NUL: u8 = 0;
const EOL: u8 = b'\n';

/// Codec for encoding/decoding STOMP frames.
///
/// A frame is `COMMAND\nkey:value\n...\n\nbody\0`. Bare EOLs between frames
/// are heart-beats and skipped. When a `content-length` header is present
/// the body may contain NUL bytes.
#[derive(Clone, Debug)]
pub struct StompCodec {
    max_frame_size: usize,
}

impl StompCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    fn check_size(&self, size: usize) -> Result<(), Error> {
        if size > self.max_frame_size {
            return Err(Error::Frame(format!(
                "frame of {size} bytes exceeds the {} byte limit",
                self.max_frame_size
            )));
        }

        Ok(())
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Offset of the first body byte: just past the blank line ending the
/// headers.
fn body_start(buf: &[u8]) -> Option<usize> {
    let mut line_start = 0;

    for (index, byte) in buf.iter().enumerate() {
        if *byte != EOL {
            continue;
        }

        let line = &buf[line_start..index];
        if line_start > 0 && (line.is_empty() || line == b"\r") {
            return Some(index + 1);
        }

        line_start = index + 1;
    }

    None
}

fn parse_head(head: &[u8]) -> Result<(FrameCommand, Headers), Error> {
    let head = std::str::from_utf8(head)
        .map_err(|e| Error::Frame(format!("frame head is not utf-8: {e}")))?;

    let mut lines = head
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line));

    let command = match lines.next() {
        Some(command) if !command.is_empty() => FrameCommand::parse(command),
        _ => return Err(Error::Frame("missing command".to_string())),
    };

    let mut headers = Headers::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let Some((key, value)) = line.split_once(':') else {
            return Err(Error::Frame(format!("malformed header line {line:?}")));
        };

        // Repeated headers keep their first value.
        headers
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }

    Ok((command, headers))
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
        let heart_beats = buf
            .iter()
            .take_while(|byte| **byte == EOL || **byte == b'\r')
            .count();
        buf.advance(heart_beats);

        if buf.is_empty() {
            return Ok(None);
        }

        let Some(body_start) = body_start(buf) else {
            self.check_size(buf.len())?;
            return Ok(None);
        };

        let (command, headers) = parse_head(&buf[..body_start])?;

        let body_end = if let Some(length) = headers.get(CONTENT_LENGTH_HEADER) {
            let length: usize = length
                .trim()
                .parse()
                .map_err(|_| Error::Frame(format!("invalid content-length {length:?}")))?;
            let body_end = body_start + length;
            self.check_size(body_end + 1)?;

            if buf.len() <= body_end {
                buf.reserve(body_end + 1 - buf.len());
                return Ok(None);
            }

            if buf[body_end] != NUL {
                return Err(Error::Frame(
                    "body does not end with NUL after content-length bytes".to_string(),
                ));
            }

            body_end
        } else {
            match buf[body_start..].iter().position(|byte| *byte == NUL) {
                Some(offset) => body_start + offset,
                None => {
                    self.check_size(buf.len())?;
                    return Ok(None);
                }
            }
        };

        let mut frame = buf.split_to(body_end + 1);
        frame.advance(body_start);
        frame.truncate(body_end - body_start);

        Ok(Some(Frame::new(command, headers, frame.freeze())))
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Error> {
        let mut headers: Vec<(&String, &String)> = frame.headers.iter().collect();
        headers.sort();

        let with_length =
            !frame.body.is_empty() && !frame.headers.contains_key(CONTENT_LENGTH_HEADER);

        let start = buf.len();

        buf.put_slice(frame.command.as_str().as_bytes());
        buf.put_u8(EOL);
        for (key, value) in headers {
            buf.put_slice(key.as_bytes());
            buf.put_u8(b':');
            buf.put_slice(value.as_bytes());
            buf.put_u8(EOL);
        }
        if with_length {
            buf.put_slice(format!("{CONTENT_LENGTH_HEADER}:{}", frame.body.len()).as_bytes());
            buf.put_u8(EOL);
        }
        buf.put_u8(EOL);
        buf.put_slice(&frame.body);
        buf.put_u8(NUL);

        self.check_size(buf.len() - start)
    }
}
