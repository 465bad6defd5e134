//! Newline framing for export bodies
//!
//! Lines are framed as raw bytes so that a line which is not valid UTF-8 or
//! not valid JSON only costs that one record. A line longer than the limit is
//! dropped as it streams past and reported as [`Line::Oversized`], so the
//! buffer never grows beyond the limit.

use std::io;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

/// One frame of an export body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Line content without the trailing `\n`. A trailing `\r` is left in place.
    Record(BytesMut),
    /// A line over the length limit was discarded; carries its length in bytes.
    Oversized(usize),
}

/// Splits a byte stream on `\n` with an upper bound on line length.
#[derive(Debug, Clone)]
pub struct LineSplitter {
    max_length: usize,
    /// Where to resume searching for `\n` in the buffer.
    next_index: usize,
    /// Bytes dropped so far from an oversized line still in progress.
    discarding: Option<usize>,
}

impl LineSplitter {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: None,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

fn find_newline(bytes: &[u8]) -> Option<usize> {
    bytes.iter().position(|b| *b == b'\n')
}

impl Decoder for LineSplitter {
    type Item = Line;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Line>> {
        loop {
            if let Some(dropped) = self.discarding {
                return Ok(match find_newline(buf) {
                    Some(i) => {
                        let _ = buf.split_to(i + 1);
                        self.discarding = None;
                        Some(Line::Oversized(dropped + i))
                    },
                    None => {
                        self.discarding = Some(dropped + buf.len());
                        buf.clear();
                        None
                    },
                });
            }

            let read_to = buf.len().min(self.max_length.saturating_add(1));
            match find_newline(&buf[self.next_index..read_to]) {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut line = buf.split_to(end + 1);
                    line.truncate(end);
                    return Ok(Some(Line::Record(line)));
                },
                None if buf.len() > self.max_length => {
                    self.next_index = 0;
                    self.discarding = Some(0);
                },
                None => {
                    self.next_index = read_to;
                    return Ok(None);
                },
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Line>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }

        self.next_index = 0;
        if let Some(dropped) = self.discarding.take() {
            let dropped = dropped + buf.len();
            buf.clear();
            return Ok(Some(Line::Oversized(dropped)));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(Line::Record(buf.split())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn split_all(splitter: &mut LineSplitter, chunks: &[&[u8]]) -> Vec<Line> {
        let mut buf = BytesMut::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(line) = splitter.decode(&mut buf).unwrap() {
                lines.push(line);
            }
        }
        while let Some(line) = splitter.decode_eof(&mut buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    fn record(bytes: &[u8]) -> Line {
        Line::Record(BytesMut::from(bytes))
    }

    #[test]
    fn test_splits_across_chunks() {
        let mut splitter = LineSplitter::new(64);
        let lines = split_all(&mut splitter, &[b"ab", b"c\r\nde", b"f\n", b"tail"]);
        assert_eq!(lines, vec![record(b"abc\r"), record(b"def"), record(b"tail")]);
    }

    #[test]
    fn test_invalid_utf8_is_just_bytes() {
        let mut splitter = LineSplitter::new(64);
        let lines = split_all(&mut splitter, &[b"ok\n\xff\xfe\nok\n"]);
        assert_eq!(lines, vec![record(b"ok"), record(b"\xff\xfe"), record(b"ok")]);
    }

    #[test]
    fn test_oversized_line_is_dropped() {
        let mut splitter = LineSplitter::new(4);
        let lines = split_all(&mut splitter, &[b"abcd\nabcdefgh", b"ijk\nxy\n"]);
        assert_eq!(lines, vec![record(b"abcd"), Line::Oversized(11), record(b"xy")]);
    }

    #[test]
    fn test_oversized_line_never_buffers_past_limit() {
        let mut splitter = LineSplitter::new(8);
        let mut buf = BytesMut::new();
        for _ in 0..100 {
            buf.extend_from_slice(b"0123456789");
            assert!(splitter.decode(&mut buf).unwrap().is_none());
            assert!(buf.len() <= 10);
        }
        buf.extend_from_slice(b"\n");
        assert_eq!(splitter.decode(&mut buf).unwrap(), Some(Line::Oversized(1000)));
    }

    #[test]
    fn test_unterminated_oversized_tail() {
        let mut splitter = LineSplitter::new(4);
        let lines = split_all(&mut splitter, &[b"a\n0123456789"]);
        assert_eq!(lines, vec![record(b"a"), Line::Oversized(10)]);
    }
}
