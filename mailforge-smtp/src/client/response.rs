use super::error::{ClientError, Result};

/// A complete (possibly multiline) SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    #[must_use]
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// All reply text joined with newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// The reply lines as received, without code or separator.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Whether any line advertises the given capability (e.g. `STARTTLS`,
    /// `PIPELINING`, `AUTH`).
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.lines.iter().any(|line| {
            let mut words = line.split_whitespace();
            words.next().is_some_and(|w| w.eq_ignore_ascii_case(name))
        })
    }

    /// Try to parse one complete reply from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the reply
    /// and the number of bytes consumed.
    pub fn parse_response(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut lines = Vec::new();
        let mut code = None;
        let mut offset = 0;

        loop {
            let rest = &buf[offset..];
            let Some(pos) = rest.windows(2).position(|w| w == b"\r\n") else {
                return Ok(None);
            };

            let line = std::str::from_utf8(&rest[..pos])
                .map_err(|_| ClientError::ParseError("non-UTF-8 reply".to_string()))?;
            offset += pos + 2;

            if line.len() < 3 {
                return Err(ClientError::ParseError(format!("short reply line: {line}")));
            }

            let this_code: u16 = line[..3]
                .parse()
                .map_err(|_| ClientError::ParseError(format!("bad status code in: {line}")))?;

            if let Some(code) = code
                && code != this_code
            {
                return Err(ClientError::ParseError(format!(
                    "inconsistent codes {code} and {this_code} in one reply"
                )));
            }
            code = Some(this_code);

            let (separator, text) = match line.as_bytes().get(3) {
                None => (b' ', ""),
                Some(&sep) => (sep, line[4..].trim_start_matches(' ').trim_end()),
            };
            lines.push(text.to_string());

            match separator {
                b'-' => {}
                b' ' => {
                    return Ok(Some((
                        Self {
                            code: this_code,
                            lines,
                        },
                        offset,
                    )));
                }
                other => {
                    return Err(ClientError::ParseError(format!(
                        "bad separator {:?} in reply line: {line}",
                        char::from(other)
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::Response;

    #[test]
    fn single_line_reply() {
        let (response, consumed) = Response::parse_response(b"250 Ok\r\n").unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.message(), "Ok");
        assert_eq!(consumed, 8);
        assert!(response.is_success());
    }

    #[test]
    fn multiline_reply() {
        let wire = b"250-mail.example says hello\r\n250-PIPELINING\r\n250-SIZE 1000\r\n250 STARTTLS\r\n";
        let (response, consumed) = Response::parse_response(wire).unwrap().unwrap();

        assert_eq!(response.code, 250);
        assert_eq!(response.lines().len(), 4);
        assert_eq!(consumed, wire.len());
        assert!(response.has_capability("STARTTLS"));
        assert!(response.has_capability("pipelining"));
        assert!(response.has_capability("SIZE"));
        assert!(!response.has_capability("CHUNKING"));
    }

    #[test]
    fn partial_reply_needs_more_data() {
        assert!(Response::parse_response(b"250-incomplete\r\n250")
            .unwrap()
            .is_none());
        assert!(Response::parse_response(b"25").unwrap().is_none());
    }

    #[test]
    fn trailing_bytes_are_not_consumed() {
        let wire = b"354 go ahead\r\n250 done\r\n";
        let (response, consumed) = Response::parse_response(wire).unwrap().unwrap();
        assert_eq!(response.code, 354);
        assert!(response.is_intermediate());
        assert_eq!(consumed, 14);
    }

    #[test]
    fn classification() {
        let (transient, _) = Response::parse_response(b"421 busy\r\n").unwrap().unwrap();
        assert!(transient.is_transient());
        assert!(!transient.is_permanent());

        let (permanent, _) = Response::parse_response(b"550 no\r\n").unwrap().unwrap();
        assert!(permanent.is_permanent());
    }

    #[test]
    fn malformed_replies_error() {
        assert!(Response::parse_response(b"xx\r\n").is_err());
        assert!(Response::parse_response(b"abc Ok\r\n").is_err());
        assert!(Response::parse_response(b"250-one\r\n354 two\r\n").is_err());
    }
}
