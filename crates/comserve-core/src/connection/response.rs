//! Matching and decoding inbound frames

/// Payload a wait is looking for
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Bytes(Vec<u8>),
    Text(String),
}

/// Expected response for [`Connection::wait_for_response`](super::Connection::wait_for_response).
///
/// A frame matches when its payload equals the pattern. By default
/// surrounding whitespace of the payload is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected {
    pattern: Pattern,
    strip: bool,
}

impl Expected {
    /// Match a text payload; invalid UTF-8 never matches
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            pattern: Pattern::Text(text.into()),
            strip: true,
        }
    }

    /// Match a byte payload
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            pattern: Pattern::Bytes(bytes.into()),
            strip: true,
        }
    }

    /// Compare payloads exactly, without trimming whitespace
    pub fn raw(mut self) -> Self {
        self.strip = false;
        self
    }

    /// Whether `payload` is the expected response
    pub fn matches(&self, payload: &[u8]) -> bool {
        match &self.pattern {
            Pattern::Bytes(expected) => {
                let payload = if self.strip { payload.trim_ascii() } else { payload };
                payload == expected.as_slice()
            }
            Pattern::Text(expected) => match std::str::from_utf8(payload) {
                Ok(s) if self.strip => s.trim() == expected.as_str(),
                Ok(s) => s == expected.as_str(),
                Err(_) => false,
            },
        }
    }
}

impl From<&str> for Expected {
    fn from(s: &str) -> Self {
        Expected::text(s)
    }
}

impl From<String> for Expected {
    fn from(s: String) -> Self {
        Expected::text(s)
    }
}

impl From<&[u8]> for Expected {
    fn from(b: &[u8]) -> Self {
        Expected::bytes(b)
    }
}

/// Decode a payload as text.
///
/// Invalid UTF-8 is replaced. With `read_until`, everything from the first
/// occurrence of the marker on is dropped. With `strip`, surrounding
/// whitespace is trimmed last.
pub fn conv_bytes_to_str(payload: &[u8], read_until: Option<&str>, strip: bool) -> String {
    let text = String::from_utf8_lossy(payload);
    let text = match read_until {
        Some(marker) if !marker.is_empty() => match text.find(marker) {
            Some(pos) => &text[..pos],
            None => &text[..],
        },
        _ => &text[..],
    };
    if strip {
        text.trim().to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_text_match_ignores_whitespace() {
        let expected = Expected::text("OK");
        assert!(expected.matches(b"OK"));
        assert!(expected.matches(b"  OK\r\n"));
        assert!(!expected.matches(b"OK!"));
        assert!(!expected.matches(&[0xff, b'O', b'K']));
    }

    #[test]
    fn test_raw_match_is_exact() {
        let expected = Expected::text("OK\r\n").raw();
        assert!(expected.matches(b"OK\r\n"));
        assert!(!expected.matches(b"OK"));

        let expected = Expected::bytes(vec![0x01, 0x20]).raw();
        assert!(expected.matches(&[0x01, 0x20]));
        assert!(!Expected::bytes(vec![0x01, 0x20]).matches(&[0x01, 0x20]));
    }

    #[test]
    fn test_bytes_match_binary_payload() {
        let expected = Expected::bytes(vec![0xde, 0xad]);
        assert!(expected.matches(&[0xde, 0xad, b'\n']));
        assert!(!expected.matches(&[0xde]));
    }

    #[test]
    fn test_conv_bytes_to_str() {
        assert_eq!(conv_bytes_to_str(b" temp=21.5\r\n", None, true), "temp=21.5");
        assert_eq!(conv_bytes_to_str(b" temp=21.5\r\n", None, false), " temp=21.5\r\n");
        assert_eq!(conv_bytes_to_str(b"VAL=3;rest", Some(";"), true), "VAL=3");
        assert_eq!(conv_bytes_to_str(b"VAL=3", Some(";"), true), "VAL=3");
        assert_eq!(conv_bytes_to_str(b"VAL=3", Some(""), true), "VAL=3");
    }
}
