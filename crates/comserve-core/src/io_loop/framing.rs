//! Inbound framing strategies
//!
//! The I/O loop reads whatever bytes the device has buffered. How those
//! bytes become frames is a policy choice, so it is configurable:
//! - `Raw`: every non-empty read becomes one frame
//! - `Delimiter`: split on a byte sequence, carrying partial frames over
//!   to the next read

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::codec::Decoder;

/// Framing policy for inbound data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FramingConfig {
    /// One frame per read, exactly as the device delivered it
    #[default]
    Raw,
    /// Delimiter-based framing
    Delimiter {
        /// Delimiter byte sequence (e.g., [0x0D, 0x0A] for CRLF)
        delimiter: Vec<u8>,
        /// Longest payload before a forced split, 0 for unlimited. The
        /// delimiter itself is not counted.
        max_length: usize,
        /// Whether to include delimiter in output frames
        include_delimiter: bool,
    },
}

impl FramingConfig {
    /// Newline-terminated lines, delimiter stripped
    pub fn lines() -> Self {
        FramingConfig::Delimiter {
            delimiter: b"\n".to_vec(),
            max_length: 4096,
            include_delimiter: false,
        }
    }
}

/// Stateful splitter implementing a [`FramingConfig`]
#[derive(Debug, Clone)]
pub struct Framer {
    config: FramingConfig,
    buffer: BytesMut,
}

impl Framer {
    /// Create a framer with an empty carry-over buffer
    pub fn new(config: FramingConfig) -> Self {
        Self {
            config,
            buffer: BytesMut::new(),
        }
    }

    /// Policy in use
    pub fn config(&self) -> &FramingConfig {
        &self.config
    }

    /// Append freshly read bytes and return every complete frame
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);
        let mut buffer = std::mem::take(&mut self.buffer);
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = self.decode(&mut buffer) {
            frames.push(frame);
        }
        self.buffer = buffer;
        frames
    }

    /// Bytes held back waiting for a delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl Decoder for Framer {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match &self.config {
            FramingConfig::Delimiter {
                delimiter,
                max_length,
                include_delimiter,
            } if !delimiter.is_empty() => {
                // A delimiter further out than max_length cannot end this frame
                let window = match *max_length {
                    0 => src.len(),
                    max => src.len().min(max + delimiter.len()),
                };
                if let Some(pos) = find_subsequence(&src[..window], delimiter) {
                    let mut frame = src.split_to(pos + delimiter.len());
                    if !include_delimiter {
                        frame.truncate(pos);
                    }
                    return Ok(Some(frame.freeze()));
                }
                if *max_length > 0 && src.len() >= *max_length + delimiter.len() {
                    return Ok(Some(src.split_to(*max_length).freeze()));
                }
                Ok(None)
            }
            // An empty delimiter cannot split anything
            _ => Ok(Some(src.split().freeze())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn as_vecs(frames: Vec<Bytes>) -> Vec<Vec<u8>> {
        frames.into_iter().map(|b| b.to_vec()).collect()
    }

    #[test]
    fn test_raw_emits_one_frame_per_read() {
        let mut framer = Framer::new(FramingConfig::Raw);
        assert_eq!(as_vecs(framer.feed(b"a\nb\n")), vec![b"a\nb\n".to_vec()]);
        assert!(framer.feed(b"").is_empty());
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_delimiter_carries_partial_frames() {
        let mut framer = Framer::new(FramingConfig::Delimiter {
            delimiter: b"\r\n".to_vec(),
            max_length: 0,
            include_delimiter: false,
        });

        assert_eq!(as_vecs(framer.feed(b"OK\r\nVAL")), vec![b"OK".to_vec()]);
        assert_eq!(framer.pending(), 3);
        assert_eq!(
            as_vecs(framer.feed(b"UE=1\r\n\r\n")),
            vec![b"VALUE=1".to_vec(), b"".to_vec()]
        );
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_delimiter_included_when_requested() {
        let mut framer = Framer::new(FramingConfig::Delimiter {
            delimiter: b";".to_vec(),
            max_length: 0,
            include_delimiter: true,
        });
        assert_eq!(
            as_vecs(framer.feed(b"FA00014074000;MD2;")),
            vec![b"FA00014074000;".to_vec(), b"MD2;".to_vec()]
        );
    }

    #[test]
    fn test_max_length_forces_split() {
        let mut framer = Framer::new(FramingConfig::Delimiter {
            delimiter: b"\n".to_vec(),
            max_length: 4,
            include_delimiter: false,
        });
        assert_eq!(
            as_vecs(framer.feed(b"abcdefghij")),
            vec![b"abcd".to_vec(), b"efgh".to_vec()]
        );
        assert_eq!(framer.pending(), 2);
        framer.reset();
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_late_delimiter_does_not_stretch_frame() {
        let mut framer = Framer::new(FramingConfig::Delimiter {
            delimiter: b"\n".to_vec(),
            max_length: 4,
            include_delimiter: false,
        });
        let frames = as_vecs(framer.feed(b"abcdefghij\n"));
        assert_eq!(
            frames,
            vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]
        );
        assert!(frames.iter().all(|f| f.len() <= 4));
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_delimiter_right_at_max_length() {
        let mut framer = Framer::new(FramingConfig::Delimiter {
            delimiter: b"\r\n".to_vec(),
            max_length: 4,
            include_delimiter: false,
        });
        // Not split yet: the delimiter may still follow
        assert!(framer.feed(b"abcd").is_empty());
        assert_eq!(as_vecs(framer.feed(b"\r\n")), vec![b"abcd".to_vec()]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_framing_config_serde() {
        let json = serde_json::to_string(&FramingConfig::lines()).unwrap();
        assert!(json.contains("\"type\":\"delimiter\""));
        let back: FramingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FramingConfig::lines());

        let raw: FramingConfig = serde_json::from_str(r#"{"type":"raw"}"#).unwrap();
        assert_eq!(raw, FramingConfig::Raw);
    }
}
