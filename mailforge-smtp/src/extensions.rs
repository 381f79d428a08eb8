use core::fmt::{self, Display};

/// ESMTP extensions advertised in the EHLO response.
///
/// The advertised set depends on session state: STARTTLS disappears once the
/// connection is upgraded, AUTH only appears when a verifier is configured
/// (and, when a secure connection is required, only after the upgrade).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    Pipelining,
    EightBitMime,
    SmtpUtf8,
    /// Advertised maximum message size in bytes; zero advertises no fixed
    /// maximum (RFC 1870).
    Size(usize),
    Chunking,
    Starttls,
    /// SASL mechanisms offered, e.g. `PLAIN LOGIN`.
    Auth(Vec<&'static str>),
    Help,
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Pipelining => fmt.write_str("PIPELINING"),
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::SmtpUtf8 => fmt.write_str("SMTPUTF8"),
            Self::Size(max) => {
                if *max == 0 {
                    fmt.write_str("SIZE")
                } else {
                    write!(fmt, "SIZE {max}")
                }
            }
            Self::Chunking => fmt.write_str("CHUNKING"),
            Self::Starttls => fmt.write_str("STARTTLS"),
            Self::Auth(mechanisms) => {
                fmt.write_str("AUTH")?;
                for mechanism in mechanisms {
                    write!(fmt, " {mechanism}")?;
                }
                Ok(())
            }
            Self::Help => fmt.write_str("HELP"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Extension;

    #[test]
    fn extension_display() {
        assert_eq!(Extension::Size(100_000_000).to_string(), "SIZE 100000000");
        assert_eq!(Extension::Size(0).to_string(), "SIZE");
        assert_eq!(
            Extension::Auth(vec!["PLAIN", "LOGIN"]).to_string(),
            "AUTH PLAIN LOGIN"
        );
        assert_eq!(Extension::Pipelining.to_string(), "PIPELINING");
        assert_eq!(Extension::Starttls.to_string(), "STARTTLS");
        assert_eq!(Extension::EightBitMime.to_string(), "8BITMIME");
        assert_eq!(Extension::SmtpUtf8.to_string(), "SMTPUTF8");
        assert_eq!(Extension::Chunking.to_string(), "CHUNKING");
    }
}
