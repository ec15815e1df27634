use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::serial::{error::LinkError, TelemetryLine};

/// This codec has a configurable delimiter character for reading,
/// and optionally adds a character to each line it encodes.
///
/// Decoded lines are utf8-decoded lossily and trimmed.
/// Lines which are empty after trimming are skipped.
/// Lines longer than the maximum length are dropped as a whole.
#[derive(Debug, Clone)]
pub struct LinesCodec {
    /// How far we have looked for a delimiter into the buffer
    cursor: usize,

    /// Longest line we yield, delimiter excluded.
    max_length: usize,

    /// Set while skipping the rest of an overlong line.
    discarding: bool,

    /// How to delimit incoming byte streams.
    /// This delimiter is not included in the yielded frames.
    read_delimiter: u8,

    /// If provided, which byte to append when writing (encoding) messages.
    /// If `None`, forwards the data as-is.
    write_delimiter: Option<u8>,
}

impl LinesCodec {
    /// Create a new codec, with lines capped at [`MAX_LINE_LENGTH`].
    pub fn new(read_delimiter: u8, write_delimiter: Option<u8>) -> Self {
        Self {
            cursor: 0,
            max_length: MAX_LINE_LENGTH,
            discarding: false,
            read_delimiter,
            write_delimiter,
        }
    }

    /// Use another maximum line length.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }
}

/// Default cap on the length of decoded lines.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

impl Default for LinesCodec {
    fn default() -> Self {
        Self::new(b'\n', Some(b'\n'))
    }
}

impl Decoder for LinesCodec {
    type Item = TelemetryLine;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = src.len();

            let look_at = &src[self.cursor..read_to];

            let Some(position) = look_at.iter().position(|&byte| byte == self.read_delimiter) else {
                if read_to > self.max_length {
                    if !self.discarding {
                        warn!(max_length = self.max_length, "Line too long, dropping it");
                    }
                    self.discarding = true;
                    self.cursor = 0;
                    src.clear();
                    return Ok(None);
                }

                // No full frame yet.
                // The next call sees the same buffer, possibly with more data,
                // so there is no need to re-read what we already looked at.
                self.cursor = read_to;
                return Ok(None);
            };

            // Since we might "start late" in the buffer (from the cursor),
            // the "global" position within the buffer has to be calculated.
            let actual_position = self.cursor + position;
            self.cursor = 0;

            let line = src.split_to(actual_position);

            // Discard the delimiter.
            src.advance(1);

            if self.discarding {
                // The tail of a line we already gave up on
                self.discarding = false;
                continue;
            }

            if line.len() > self.max_length {
                warn!(
                    length = line.len(),
                    max_length = self.max_length,
                    "Line too long, dropping it"
                );
                continue;
            }

            let line = TelemetryLine::new_lossy(&line);
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        // Whatever is left is an unterminated last line.
        self.cursor = 0;
        if std::mem::take(&mut self.discarding) {
            src.clear();
            return Ok(None);
        }
        if src.is_empty() {
            return Ok(None);
        }

        let rest = src.split_to(src.len());
        let line = TelemetryLine::new_lossy(&rest);

        Ok((!line.is_empty()).then_some(line))
    }
}

impl Encoder<String> for LinesCodec {
    type Error = LinkError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());

        if let Some(character) = self.write_delimiter {
            dst.put_u8(character);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LinesCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = vec![];
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line.into_inner());
        }
        lines
    }

    #[test]
    fn splits_on_newline_and_trims() {
        let mut codec = LinesCodec::default();
        let mut buf = BytesMut::from(&b"LCD:Temp=23C\r\nhumidity=40\n"[..]);

        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec!["LCD:Temp=23C", "humidity=40"]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_line_waits_for_more() {
        let mut codec = LinesCodec::default();
        let mut buf = BytesMut::from(&b"LCD:Te"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"mp=23C\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(line.as_str(), "LCD:Temp=23C");
    }

    #[test]
    fn empty_lines_are_skipped() {
        let mut codec = LinesCodec::default();
        let mut buf = BytesMut::from(&b"\n\r\n   \nok\n\n"[..]);

        assert_eq!(decode_all(&mut codec, &mut buf), vec!["ok"]);
    }

    #[test]
    fn invalid_utf8_is_not_fatal() {
        let mut codec = LinesCodec::default();
        let mut buf = BytesMut::from(&b"a\xfe\xffb\n"[..]);

        let line = codec.decode(&mut buf).unwrap().unwrap();

        assert!(line.as_str().starts_with('a'));
        assert!(line.as_str().ends_with('b'));
    }

    #[test]
    fn eof_yields_unterminated_line() {
        let mut codec = LinesCodec::default();
        let mut buf = BytesMut::from(&b"first\nlast"[..]);

        assert_eq!(codec.decode_eof(&mut buf).unwrap().unwrap().as_str(), "first");
        assert_eq!(codec.decode_eof(&mut buf).unwrap().unwrap().as_str(), "last");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn overlong_partial_line_is_dropped() {
        let mut codec = LinesCodec::default().with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789abc"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        // The rest of the overlong line goes too, the next one is fine
        buf.extend_from_slice(b"def\nok\n");
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["ok"]);
    }

    #[test]
    fn overlong_complete_line_is_dropped() {
        let mut codec = LinesCodec::default().with_max_length(8);
        let mut buf = BytesMut::from(&b"short\n0123456789\nafter\n"[..]);

        assert_eq!(decode_all(&mut codec, &mut buf), vec!["short", "after"]);
    }

    #[test]
    fn eof_while_dropping_yields_nothing() {
        let mut codec = LinesCodec::default().with_max_length(4);
        let mut buf = BytesMut::from(&b"0123456789"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"tail");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_appends_delimiter() {
        let mut codec = LinesCodec::default();
        let mut buf = BytesMut::new();

        codec
            .encode(r#"{"sensor": "temp", "value": 23.5}"#.to_owned(), &mut buf)
            .unwrap();

        assert_eq!(&buf[..], b"{\"sensor\": \"temp\", \"value\": 23.5}\n");
    }

    #[test]
    fn encode_without_delimiter_is_verbatim() {
        let mut codec = LinesCodec::new(b'\n', None);
        let mut buf = BytesMut::new();

        codec.encode("raw".to_owned(), &mut buf).unwrap();

        assert_eq!(&buf[..], b"raw");
    }
}
