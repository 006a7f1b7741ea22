//! Reassembly of a raw byte stream into delimited frames.
//!
//! Serial reads return arbitrary slices of the device output: half a line,
//! several lines, or a delimiter split between two reads. `FrameReader`
//! buffers bytes until a delimiter arrives and hands out one frame at a time.

use std::fmt;

use crate::config::{FrameConfig, escape_bytes};

/// One complete, not yet parsed unit of device output (delimiter excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True when the frame holds nothing but ASCII whitespace.
    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(u8::is_ascii_whitespace)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&escape_bytes(&self.bytes))
    }
}

/// Unterminated data grew past the configured limit; the buffer was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOverflow {
    /// Bytes thrown away with the reset.
    pub discarded: usize,
    pub limit: usize,
}

impl fmt::Display for FrameOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame exceeds {} bytes without delimiter; discarded {} buffered bytes",
            self.limit, self.discarded
        )
    }
}

impl std::error::Error for FrameOverflow {}

pub struct FrameReader {
    delimiter: Vec<u8>,
    max_frame_len: usize,
    buffer: Vec<u8>,
    /// Offset up to which `buffer` is known not to contain a delimiter start.
    scanned: usize,
}

impl FrameReader {
    pub fn new(config: &FrameConfig) -> Self {
        let delimiter = if config.delimiter.is_empty() {
            b"\n".to_vec()
        } else {
            config.delimiter.clone()
        };
        Self {
            delimiter,
            max_frame_len: config.max_frame_len,
            buffer: Vec::new(),
            scanned: 0,
        }
    }

    /// Appends raw bytes from the device.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Removes and returns the first complete frame, if one is buffered.
    ///
    /// Returns `Err(FrameOverflow)` exactly once when a frame grows past the
    /// limit, after which the buffer is empty.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameOverflow> {
        let dlen = self.delimiter.len();

        let found = self.buffer[self.scanned..]
            .windows(dlen)
            .position(|w| w == self.delimiter.as_slice())
            .map(|rel| self.scanned + rel);

        match found {
            Some(end) if end > self.max_frame_len => Err(self.overflow()),
            Some(end) => {
                let frame: Vec<u8> = self.buffer.drain(..end + dlen).take(end).collect();
                self.scanned = 0;
                Ok(Some(Frame::new(frame)))
            }
            None => {
                // A partial delimiter may sit at the tail; it is not frame body.
                if self.buffer.len() > self.max_frame_len.saturating_add(dlen - 1) {
                    return Err(self.overflow());
                }
                self.scanned = self.buffer.len().saturating_sub(dlen - 1);
                Ok(None)
            }
        }
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drops everything buffered. Used when the connection is reopened.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }

    fn overflow(&mut self) -> FrameOverflow {
        let discarded = self.buffer.len();
        self.reset();
        FrameOverflow {
            discarded,
            limit: self.max_frame_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(delimiter: &[u8], max_frame_len: usize) -> FrameReader {
        FrameReader::new(&FrameConfig {
            delimiter: delimiter.to_vec(),
            max_frame_len,
        })
    }

    fn drain(reader: &mut FrameReader) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            frames.push(frame.as_bytes().to_vec());
        }
        frames
    }

    fn frames_with_splits(input: &[u8], delimiter: &[u8], splits: &[usize]) -> Vec<Vec<u8>> {
        let mut r = reader(delimiter, 64);
        let mut frames = Vec::new();
        let mut start = 0;
        for &split in splits.iter().chain(std::iter::once(&input.len())) {
            r.feed(&input[start..split]);
            frames.extend(drain(&mut r));
            start = split;
        }
        frames
    }

    #[test]
    fn test_two_frames_in_one_feed() {
        let mut r = reader(b"\n", 64);
        r.feed(b"23.5,41\n24.1,40\n");
        assert_eq!(drain(&mut r), vec![b"23.5,41".to_vec(), b"24.1,40".to_vec()]);
        assert_eq!(r.pending_len(), 0);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let mut r = reader(b"\n", 64);
        r.feed(b"23.");
        assert_eq!(r.next_frame().unwrap(), None);
        r.feed(b"5\n24");
        assert_eq!(r.next_frame().unwrap(), Some(Frame::new(b"23.5".to_vec())));
        assert_eq!(r.next_frame().unwrap(), None);
        assert_eq!(r.pending_len(), 2);
    }

    #[test]
    fn test_delimiter_split_across_feeds() {
        let mut r = reader(b"\r\n", 64);
        r.feed(b"21.0\r");
        assert_eq!(r.next_frame().unwrap(), None);
        r.feed(b"\n22.0\r\n");
        assert_eq!(drain(&mut r), vec![b"21.0".to_vec(), b"22.0".to_vec()]);
    }

    #[test]
    fn test_every_split_point_yields_same_frames() {
        let input = b"23.5,41\r\n\r\n24.1,40\r\n19.0 Celsius\r\n-3.25,88\r\n";
        let expected = frames_with_splits(input, b"\r\n", &[]);
        assert_eq!(expected.len(), 5);

        for a in 0..=input.len() {
            for b in a..=input.len() {
                assert_eq!(
                    frames_with_splits(input, b"\r\n", &[a, b]),
                    expected,
                    "splits at {} and {}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_byte_at_a_time_with_token_delimiter() {
        let input = b"23.45 Celsius, 23.50 Celsius, 23.61 Celsius, ";
        let splits: Vec<usize> = (1..input.len()).collect();
        let frames = frames_with_splits(input, b", ", &splits);
        assert_eq!(
            frames,
            vec![
                b"23.45 Celsius".to_vec(),
                b"23.50 Celsius".to_vec(),
                b"23.61 Celsius".to_vec()
            ]
        );
    }

    #[test]
    fn test_overflow_without_delimiter() {
        let mut r = reader(b"\n", 8);
        r.feed(b"12345678");
        assert_eq!(r.next_frame().unwrap(), None);

        r.feed(b"9");
        let err = r.next_frame().unwrap_err();
        assert_eq!(
            err,
            FrameOverflow {
                discarded: 9,
                limit: 8
            }
        );
        assert_eq!(r.pending_len(), 0);
        // Exactly one overflow: the reader is clean afterwards.
        assert_eq!(r.next_frame().unwrap(), None);
    }

    #[test]
    fn test_overflow_of_delimited_frame() {
        let mut r = reader(b"\n", 4);
        r.feed(b"123456\n7\n");
        assert!(r.next_frame().is_err());
        assert_eq!(r.pending_len(), 0);
        assert_eq!(r.next_frame().unwrap(), None);
    }

    #[test]
    fn test_frame_at_exact_limit_with_partial_delimiter() {
        let mut r = reader(b"\r\n", 4);
        r.feed(b"1234\r");
        assert_eq!(r.next_frame().unwrap(), None);
        r.feed(b"\n");
        assert_eq!(r.next_frame().unwrap(), Some(Frame::new(b"1234".to_vec())));
    }

    #[test]
    fn test_unbounded_limit_with_multibyte_delimiter() {
        let config = FrameConfig {
            delimiter: b"\r\n".to_vec(),
            max_frame_len: usize::MAX,
        };
        assert!(config.validate().is_ok());
        let mut r = FrameReader::new(&config);
        r.feed(b"23.5");
        assert_eq!(r.next_frame().unwrap(), None);
        assert_eq!(r.pending_len(), 4);
        r.feed(b"\r\n");
        assert_eq!(r.next_frame().unwrap(), Some(Frame::new(b"23.5".to_vec())));
    }

    #[test]
    fn test_reset_clears_partial_data() {
        let mut r = reader(b"\n", 64);
        r.feed(b"garbage from old session");
        r.reset();
        r.feed(b"20.0\n");
        assert_eq!(drain(&mut r), vec![b"20.0".to_vec()]);
    }

    #[test]
    fn test_blank_frames() {
        assert!(Frame::new(b" \r".to_vec()).is_blank());
        assert!(Frame::new(Vec::new()).is_blank());
        assert!(!Frame::new(b"1".to_vec()).is_blank());
        assert_eq!(Frame::new(b"a\r".to_vec()).to_string(), "a\\r");
    }
}
