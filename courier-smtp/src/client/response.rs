//! SMTP reply parsing.

use super::error::{ClientError, Result};

/// Coarse classification of an SMTP reply code.
///
/// Everything except [`ReplyClass::Fatal`] is worth retrying later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// 2xx and 3xx
    Positive,
    /// 4xx
    Busy,
    /// 50x
    Syntax,
    /// 53x
    Authentication,
    /// Any other 5xx
    Fatal,
    /// Codes outside 2xx-5xx
    Unknown,
}

impl ReplyClass {
    #[must_use]
    pub const fn of(code: u16) -> Self {
        match code {
            200..=399 => Self::Positive,
            400..=499 => Self::Busy,
            500..=509 => Self::Syntax,
            530..=539 => Self::Authentication,
            510..=599 => Self::Fatal,
            _ => Self::Unknown,
        }
    }
}

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The reply text with continuation lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn class(&self) -> ReplyClass {
        ReplyClass::of(self.code)
    }

    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 400
    }

    /// Whether an EHLO reply advertises `keyword` (case-insensitive).
    #[must_use]
    pub fn has_extension(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(keyword))
        })
    }

    /// Parses one complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when the
    /// buffer does not yet hold a final (`NNN `) line.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut code = None;
        let mut lines = Vec::new();
        let mut offset = 0;

        while let Some(end) = buffer[offset..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[offset..offset + end];
            offset += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let (line_code, last, text) = parse_line(raw)?;
            match code {
                None => code = Some(line_code),
                Some(expected) if expected != line_code => {
                    return Err(ClientError::Parse(format!(
                        "Status code mismatch in multi-line response: expected {expected}, got {line_code}"
                    )));
                }
                Some(_) => {}
            }
            lines.push(text);

            if last {
                return Ok(code.map(|code| (Self::new(code, lines), offset)));
            }
        }

        Ok(None)
    }
}

fn parse_line(raw: &[u8]) -> Result<(u16, bool, String)> {
    let line = String::from_utf8_lossy(raw);
    if line.len() < 3 || !line.is_char_boundary(3) {
        return Err(ClientError::Parse(format!("Response line too short: '{line}'")));
    }

    let code = line[..3]
        .parse::<u16>()
        .map_err(|_| ClientError::Parse(format!("Invalid status code: '{}'", &line[..3])))?;

    let last = match line.as_bytes().get(3) {
        None | Some(b' ') => true,
        Some(b'-') => false,
        Some(other) => {
            return Err(ClientError::Parse(format!(
                "Invalid separator character: '{}'",
                char::from(*other)
            )));
        }
    };

    let text = line.get(4..).unwrap_or_default().to_string();
    Ok((code, last, text))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_single_line() {
        let (response, consumed) = Response::parse(b"250 OK\r\n").unwrap().unwrap();
        assert_eq!(response, Response::new(250, vec!["OK".to_string()]));
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_parse_multi_line() {
        let data = b"250-mx.example.com\r\n250-SIZE 10000000\r\n250 STARTTLS\r\n";
        let (response, consumed) = Response::parse(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.lines,
            vec!["mx.example.com", "SIZE 10000000", "STARTTLS"]
        );
        assert_eq!(consumed, data.len());
        assert!(response.has_extension("starttls"));
        assert!(!response.has_extension("mx.example.com"));
    }

    #[test]
    fn test_parse_leaves_trailing_reply() {
        let data = b"250 OK\r\n354 Go ahead\r\n";
        let (response, consumed) = Response::parse(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        let (next, _) = Response::parse(&data[consumed..]).unwrap().unwrap();
        assert_eq!(next.code, 354);
    }

    #[test]
    fn test_parse_incomplete() {
        assert!(Response::parse(b"250-mx.example.com\r\n250-SIZE").unwrap().is_none());
        assert!(Response::parse(b"").unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_mismatched_codes() {
        assert!(Response::parse(b"250-first\r\n251 second\r\n").is_err());
        assert!(Response::parse(b"25\r\n").is_err());
        assert!(Response::parse(b"250*bad\r\n").is_err());
    }

    #[test]
    fn test_reply_class() {
        assert_eq!(ReplyClass::of(250), ReplyClass::Positive);
        assert_eq!(ReplyClass::of(354), ReplyClass::Positive);
        assert_eq!(ReplyClass::of(421), ReplyClass::Busy);
        assert_eq!(ReplyClass::of(501), ReplyClass::Syntax);
        assert_eq!(ReplyClass::of(535), ReplyClass::Authentication);
        assert_eq!(ReplyClass::of(550), ReplyClass::Fatal);
        assert_eq!(ReplyClass::of(199), ReplyClass::Unknown);
    }
}
