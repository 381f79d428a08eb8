use core::fmt::{self, Display, Formatter};

use mailforge_common::{address::Address, envelope::BodyKind};

/// ESMTP parameters attached to MAIL FROM / RCPT TO, parsed from
/// `KEY[=VALUE]` pairs (RFC 5321 section 4.1.2).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailParameters {
    pub size: Option<usize>,
    pub body: Option<BodyKind>,
    pub auth: Option<String>,
    pub utf8: bool,
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size.is_none() && self.body.is_none() && self.auth.is_none() && !self.utf8
    }

    /// Parse the whitespace-separated parameter list that follows the path.
    fn parse(rest: &str) -> Result<Self, ParseError> {
        let mut params = Self::new();

        for param in rest.split_whitespace() {
            let (key, value) = param
                .split_once('=')
                .map_or((param, None), |(k, v)| (k, Some(v)));

            if key.eq_ignore_ascii_case("SIZE") {
                if params.size.is_some() {
                    return Err(ParseError::InvalidParameter(
                        "duplicate SIZE parameter".to_string(),
                    ));
                }
                let value = value.ok_or_else(|| {
                    ParseError::InvalidParameter("SIZE requires a value".to_string())
                })?;
                let size = value.parse::<usize>().map_err(|_| {
                    ParseError::InvalidParameter(format!("invalid SIZE value {value}"))
                })?;
                // RFC 1870: zero means "no declared size"
                params.size = (size > 0).then_some(size);
            } else if key.eq_ignore_ascii_case("BODY") {
                let value = value.ok_or_else(|| {
                    ParseError::InvalidParameter("BODY requires a value".to_string())
                })?;
                params.body = Some(if value.eq_ignore_ascii_case("8BITMIME") {
                    BodyKind::EightBitMime
                } else if value.eq_ignore_ascii_case("7BIT") {
                    BodyKind::SevenBit
                } else {
                    return Err(ParseError::InvalidParameter(format!(
                        "invalid BODY value {value}"
                    )));
                });
            } else if key.eq_ignore_ascii_case("AUTH") {
                params.auth = value.map(str::to_string);
            } else if key.eq_ignore_ascii_case("SMTPUTF8") {
                if value.is_some() {
                    return Err(ParseError::InvalidParameter(
                        "SMTPUTF8 takes no value".to_string(),
                    ));
                }
                params.utf8 = true;
            } else {
                return Err(ParseError::InvalidParameter(format!(
                    "unrecognised parameter {key}"
                )));
            }
        }

        Ok(params)
    }
}

impl Display for MailParameters {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |fmt: &mut Formatter<'_>| {
            if first {
                first = false;
                Ok(())
            } else {
                fmt.write_str(" ")
            }
        };

        if let Some(size) = self.size {
            sep(fmt)?;
            write!(fmt, "SIZE={size}")?;
        }
        if let Some(body) = self.body {
            sep(fmt)?;
            match body {
                BodyKind::SevenBit => fmt.write_str("BODY=7BIT")?,
                BodyKind::EightBitMime => fmt.write_str("BODY=8BITMIME")?,
            }
        }
        if let Some(auth) = &self.auth {
            sep(fmt)?;
            write!(fmt, "AUTH={auth}")?;
        }
        if self.utf8 {
            sep(fmt)?;
            fmt.write_str("SMTPUTF8")?;
        }

        Ok(())
    }
}

/// A parsed SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// `None` sender is the null reverse-path `<>` from RFC 5321.
    MailFrom {
        sender: Option<Address>,
        params: MailParameters,
    },
    RcptTo {
        recipient: Address,
        params: MailParameters,
    },
    Data,
    Bdat {
        size: usize,
        last: bool,
    },
    Rset,
    Noop,
    Quit,
    Vrfy(String),
    Expn(String),
    Help,
}

/// Why a command line failed to parse. `UnknownCommand` maps to 500,
/// `InvalidParameter` to 501 at the session boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    UnknownCommand(String),
    InvalidParameter(String),
}

impl Display for ParseError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand(c) => write!(fmt, "unrecognised command {c}"),
            Self::InvalidParameter(p) => write!(fmt, "{p}"),
        }
    }
}

impl Command {
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Helo(_) => "HELO",
            Self::Ehlo(_) => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::Auth { .. } => "AUTH",
            Self::MailFrom { .. } => "MAIL",
            Self::RcptTo { .. } => "RCPT",
            Self::Data => "DATA",
            Self::Bdat { .. } => "BDAT",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::Vrfy(_) => "VRFY",
            Self::Expn(_) => "EXPN",
            Self::Help => "HELP",
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(host) => write!(fmt, "HELO {host}"),
            Self::Ehlo(host) => write!(fmt, "EHLO {host}"),
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::MailFrom { sender, params } => {
                let addr = sender
                    .as_ref()
                    .and_then(|s| s.email())
                    .unwrap_or_default();
                if params.is_empty() {
                    write!(fmt, "MAIL FROM:<{addr}>")
                } else {
                    write!(fmt, "MAIL FROM:<{addr}> {params}")
                }
            }
            Self::RcptTo { recipient, params } => {
                let addr = recipient.email().unwrap_or_default();
                if params.is_empty() {
                    write!(fmt, "RCPT TO:<{addr}>")
                } else {
                    write!(fmt, "RCPT TO:<{addr}> {params}")
                }
            }
            Self::Bdat { size, last } => {
                if *last {
                    write!(fmt, "BDAT {size} LAST")
                } else {
                    write!(fmt, "BDAT {size}")
                }
            }
            Self::Vrfy(what) => write!(fmt, "VRFY {what}"),
            Self::Expn(what) => write!(fmt, "EXPN {what}"),
            other => fmt.write_str(other.verb()),
        }
    }
}

fn parse_path(input: &str) -> Result<(Option<Address>, &str), ParseError> {
    let input = input.trim_start();

    // Angle-bracketed form: the path runs to the matching '>'
    let (path, rest) = if let Some(stripped) = input.strip_prefix('<') {
        let close = stripped
            .find('>')
            .ok_or_else(|| ParseError::InvalidParameter("unterminated path".to_string()))?;
        (&stripped[..close], &stripped[close + 1..])
    } else {
        // Tolerate the bare form some clients send
        input
            .split_once(char::is_whitespace)
            .map_or((input, ""), |(path, rest)| (path, rest))
    };

    if path.is_empty() {
        return Ok((None, rest));
    }

    let address = Address::parse(path)
        .ok_or_else(|| ParseError::InvalidParameter(format!("invalid path {path}")))?;

    Ok((Some(address), rest))
}

impl TryFrom<&str> for Command {
    type Error = ParseError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let trimmed = line.trim();
        let upper = trimmed.to_ascii_uppercase();

        if let Some(rest) = strip_verb(trimmed, &upper, "MAIL FROM:") {
            let (sender, params) = parse_path(rest)?;
            return Ok(Self::MailFrom {
                sender,
                params: MailParameters::parse(params)?,
            });
        }

        if let Some(rest) = strip_verb(trimmed, &upper, "RCPT TO:") {
            let (recipient, params) = parse_path(rest)?;
            let recipient = recipient
                .ok_or_else(|| ParseError::InvalidParameter("empty forward-path".to_string()))?;
            return Ok(Self::RcptTo {
                recipient,
                params: MailParameters::parse(params)?,
            });
        }

        let (verb, rest) = trimmed
            .split_once(char::is_whitespace)
            .map_or((trimmed, ""), |(v, r)| (v, r.trim()));

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => {
                if rest.is_empty() {
                    Err(ParseError::InvalidParameter(
                        "HELO requires a domain".to_string(),
                    ))
                } else {
                    Ok(Self::Helo(rest.to_string()))
                }
            }
            "EHLO" => {
                if rest.is_empty() {
                    Err(ParseError::InvalidParameter(
                        "EHLO requires a domain".to_string(),
                    ))
                } else {
                    Ok(Self::Ehlo(rest.to_string()))
                }
            }
            "STARTTLS" => Ok(Self::StartTls),
            "AUTH" => {
                let mut parts = rest.split_whitespace();
                let mechanism = parts
                    .next()
                    .ok_or_else(|| {
                        ParseError::InvalidParameter("AUTH requires a mechanism".to_string())
                    })?
                    .to_ascii_uppercase();
                let initial = parts.next().map(str::to_string);
                Ok(Self::Auth { mechanism, initial })
            }
            "DATA" => Ok(Self::Data),
            "BDAT" => {
                let mut parts = rest.split_whitespace();
                let size = parts
                    .next()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| {
                        ParseError::InvalidParameter("BDAT requires a chunk size".to_string())
                    })?;
                let last = match parts.next() {
                    None => false,
                    Some(word) if word.eq_ignore_ascii_case("LAST") => true,
                    Some(other) => {
                        return Err(ParseError::InvalidParameter(format!(
                            "unexpected BDAT argument {other}"
                        )));
                    }
                };
                Ok(Self::Bdat { size, last })
            }
            "RSET" => Ok(Self::Rset),
            "NOOP" => Ok(Self::Noop),
            "QUIT" => Ok(Self::Quit),
            "VRFY" => Ok(Self::Vrfy(rest.to_string())),
            "EXPN" => Ok(Self::Expn(rest.to_string())),
            "HELP" => Ok(Self::Help),
            _ => Err(ParseError::UnknownCommand(trimmed.to_string())),
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = ParseError;

    fn try_from(line: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(line).map_or_else(
            |_| Err(ParseError::UnknownCommand("<non-UTF-8 line>".to_string())),
            Self::try_from,
        )
    }
}

fn strip_verb<'a>(original: &'a str, upper: &str, prefix: &str) -> Option<&'a str> {
    upper
        .starts_with(prefix)
        .then(|| &original[prefix.len()..])
}
