//! Line codec for the status channel.
//!
//! Frames are newline-terminated JSON objects. Decoding yields [`Command`]s and
//! never fails on bad input: malformed lines become [`Command::ParseError`].
//! Encoding renders a whole [`Reply`] line into one buffer so that it can be
//! written with a single `write` call; the loader and its workers share the
//! descriptor, and whole-line writes keep their output from interleaving.

use std::cmp;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{Command, Reply};

/// Longest command line accepted before the rest of the line is discarded.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// How much of an overlong line is kept for diagnostics.
const RAW_LINE_PREVIEW: usize = 128;

/// Codec that splits supervisor input into commands and renders replies.
#[derive(Debug, Clone)]
pub struct StatusCodec {
    max_line_length: usize,
    /// Where to resume searching for a newline in the buffer.
    next_index: usize,
    /// Set while skipping the remainder of an overlong line.
    discarding: bool,
}

impl Default for StatusCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl StatusCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
            discarding: false,
        }
    }

    fn line_to_command(line: &[u8]) -> Command {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Command::parse(&String::from_utf8_lossy(line))
    }
}

impl Decoder for StatusCodec {
    type Item = Command;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, io::Error> {
        loop {
            let read_to = cmp::min(self.max_line_length.saturating_add(1), src.len());
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    src.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let newline_index = self.next_index + offset;
                    self.next_index = 0;
                    let line = src.split_to(newline_index + 1);
                    return Ok(Some(Self::line_to_command(&line[..newline_index])));
                }
                (false, None) if src.len() > self.max_line_length => {
                    let preview = String::from_utf8_lossy(&src[..RAW_LINE_PREVIEW.min(src.len())])
                        .into_owned();
                    self.discarding = true;
                    self.next_index = 0;
                    return Ok(Some(Command::parse_error(
                        preview,
                        format!("line exceeds {} bytes", self.max_line_length),
                    )));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Command>, io::Error> {
        if let Some(command) = self.decode(src)? {
            return Ok(Some(command));
        }
        self.next_index = 0;
        if self.discarding || src.is_empty() {
            self.discarding = false;
            src.clear();
            return Ok(None);
        }
        // Unterminated final line.
        let line = src.split();
        Ok(Some(Self::line_to_command(&line)))
    }
}

impl Encoder<&Reply> for StatusCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &Reply, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json =
            serde_json::to_vec(item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Render a single reply line, newline included.
pub fn encode_reply(reply: &Reply) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    StatusCodec::default().encode(reply, &mut buf)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::WorkerId;

    fn spawn(id: &str) -> Command {
        Command::Spawn {
            id: WorkerId::from(id),
        }
    }

    #[test]
    fn decodes_consecutive_lines() {
        let mut codec = StatusCodec::default();
        let mut buf = BytesMut::from(&b"{\"op\":\"spawn\",\"id\":\"a\"}\n{\"op\":\"spawn\",\"id\":\"b\"}\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(spawn("a")));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(spawn("b")));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_the_rest_of_a_partial_line() {
        let mut codec = StatusCodec::default();
        let mut buf = BytesMut::from(&b"{\"op\":\"spa"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"wn\",\"id\":\"late\"}\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(spawn("late")));
    }

    #[test]
    fn strips_carriage_returns() {
        let mut codec = StatusCodec::default();
        let mut buf = BytesMut::from(&b"{\"op\":\"spawn\",\"id\":\"crlf\"}\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(spawn("crlf")));
    }

    #[test]
    fn blank_line_is_a_parse_error() {
        let mut codec = StatusCodec::default();
        let mut buf = BytesMut::from(&b"\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Command::ParseError { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_a_parse_error() {
        let mut codec = StatusCodec::default();
        let mut buf = BytesMut::from(&b"\xff\xfe\n{\"op\":\"spawn\",\"id\":\"ok\"}\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Command::ParseError { .. })
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(spawn("ok")));
    }

    #[test]
    fn overlong_line_is_reported_once_and_skipped() {
        let mut codec = StatusCodec::new(32);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'x'; 40]);

        match codec.decode(&mut buf).unwrap() {
            Some(Command::ParseError { cause, .. }) => {
                assert_eq!(cause, "line exceeds 32 bytes");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"xxxx\n{\"op\":\"spawn\",\"id\":\"n\"}\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(spawn("n")));
    }

    #[test]
    fn decode_eof_returns_unterminated_line() {
        let mut codec = StatusCodec::default();
        let mut buf = BytesMut::from(&b"{\"op\":\"spawn\",\"id\":\"last\"}"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(spawn("last")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn encodes_one_line_per_reply() {
        let mut codec = StatusCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(&Reply::Ready, &mut buf).unwrap();
        codec
            .encode(&Reply::Ack { id: "w1".into() }, &mut buf)
            .unwrap();

        assert_eq!(
            &buf[..],
            b"{\"action\":\"ready\"}\n{\"action\":\"ack\",\"id\":\"w1\"}\n"
        );
    }

    #[test]
    fn encode_reply_ends_with_newline() {
        let line = encode_reply(&Reply::Ready).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }
}
