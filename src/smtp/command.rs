//! Tokenizes one logical SMTP line into verb + argument and extracts the
//! structured address arguments for MAIL FROM / RCPT TO.

use core::fmt::{self, Display, Formatter};

use thiserror::Error;

use super::envelope::EnvelopeAddress;

/// Maximum command line length in octets, CRLF included (RFC 5321 4.5.3.1.4).
pub const MAX_LINE_OCTETS: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Line too long")]
    LineTooLong,

    #[error("Control character in command line")]
    InvalidCharacter,

    #[error("Command line is not valid UTF-8")]
    InvalidEncoding,

    #[error("Malformed address argument: {0}")]
    MalformedAddress(String),
}

/// Recognized command verbs. Anything else is [`Verb::Unknown`] and is
/// decided by the `on_unknown` hook chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Verb {
    Helo,
    Ehlo,
    Auth,
    MailFrom,
    RcptTo,
    Data,
    Rset,
    Noop,
    Help,
    Vrfy,
    Quit,
    StartTls,
    Unknown,
}

impl Display for Verb {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::Auth => "AUTH",
            Self::MailFrom => "MAIL FROM",
            Self::RcptTo => "RCPT TO",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Help => "HELP",
            Self::Vrfy => "VRFY",
            Self::Quit => "QUIT",
            Self::StartTls => "STARTTLS",
            Self::Unknown => "unknown",
        })
    }
}

/// One ESMTP parameter from a MAIL or RCPT command, e.g. `SIZE=1024` or
/// `BODY=8BITMIME`. Keywords are uppercased; values keep their case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParam {
    pub keyword: String,
    pub value: Option<String>,
}

/// Structured arguments for the address-bearing verbs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedArgs {
    /// `sender.is_null()` marks the null reverse-path `MAIL FROM:<>`.
    MailFrom {
        sender: EnvelopeAddress,
        params: Vec<EsmtpParam>,
    },
    RcptTo {
        recipient: EnvelopeAddress,
        params: Vec<EsmtpParam>,
    },
}

impl ParsedArgs {
    #[must_use]
    pub fn params(&self) -> &[EsmtpParam] {
        match self {
            Self::MailFrom { params, .. } | Self::RcptTo { params, .. } => params,
        }
    }

    #[must_use]
    pub fn param(&self, keyword: &str) -> Option<&EsmtpParam> {
        self.params()
            .iter()
            .find(|param| param.keyword.eq_ignore_ascii_case(keyword))
    }
}

/// One parsed command line. `raw` keeps the client's octets (CRLF stripped)
/// for hooks and dialog logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpCommand {
    raw: String,
    verb: Verb,
    verb_text: String,
    argument: String,
    parsed: Option<ParsedArgs>,
}

impl SmtpCommand {
    /// Parse one CRLF-stripped command line.
    ///
    /// # Errors
    /// [`CommandError::LineTooLong`] past 512 octets (CRLF included),
    /// [`CommandError::InvalidCharacter`]/[`CommandError::InvalidEncoding`]
    /// for control bytes or broken UTF-8, and
    /// [`CommandError::MalformedAddress`] for an unparsable MAIL/RCPT path.
    pub fn parse(line: &[u8]) -> Result<Self, CommandError> {
        if line.len() > MAX_LINE_OCTETS - 2 {
            return Err(CommandError::LineTooLong);
        }

        if line
            .iter()
            .any(|&byte| (byte < 0x20 && byte != b'\t') || byte == 0x7f)
        {
            return Err(CommandError::InvalidCharacter);
        }

        let raw = std::str::from_utf8(line).map_err(|_| CommandError::InvalidEncoding)?;

        let (verb_text, argument) = match raw.find(char::is_whitespace) {
            Some(at) => (&raw[..at], raw[at..].trim()),
            None => (raw.trim(), ""),
        };

        let upper = verb_text.to_ascii_uppercase();

        let (verb, parsed) = match upper.as_str() {
            "HELO" => (Verb::Helo, None),
            "EHLO" => (Verb::Ehlo, None),
            "AUTH" => (Verb::Auth, None),
            "MAIL" => {
                let path = strip_keyword(argument, "FROM:")
                    .ok_or_else(|| CommandError::MalformedAddress(raw.to_string()))?;
                let (sender, params) = parse_path(path, true)?;
                (Verb::MailFrom, Some(ParsedArgs::MailFrom { sender, params }))
            }
            "RCPT" => {
                let path = strip_keyword(argument, "TO:")
                    .ok_or_else(|| CommandError::MalformedAddress(raw.to_string()))?;
                let (recipient, params) = parse_path(path, false)?;
                (Verb::RcptTo, Some(ParsedArgs::RcptTo { recipient, params }))
            }
            "DATA" => (Verb::Data, None),
            "RSET" => (Verb::Rset, None),
            "NOOP" => (Verb::Noop, None),
            "HELP" => (Verb::Help, None),
            "VRFY" => (Verb::Vrfy, None),
            "QUIT" => (Verb::Quit, None),
            "STARTTLS" => (Verb::StartTls, None),
            _ => (Verb::Unknown, None),
        };

        Ok(Self {
            raw: raw.to_string(),
            verb,
            verb_text: upper,
            argument: argument.to_string(),
            parsed,
        })
    }

    #[inline]
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    #[inline]
    #[must_use]
    pub const fn verb(&self) -> Verb {
        self.verb
    }

    /// The uppercased verb token as the client sent it; for unknown
    /// commands this is the only place the verb survives.
    #[inline]
    #[must_use]
    pub fn verb_text(&self) -> &str {
        &self.verb_text
    }

    #[inline]
    #[must_use]
    pub fn argument(&self) -> &str {
        &self.argument
    }

    #[inline]
    #[must_use]
    pub const fn parsed(&self) -> Option<&ParsedArgs> {
        self.parsed.as_ref()
    }
}

impl Display for SmtpCommand {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.raw)
    }
}

/// Case-insensitively strip `FROM:` / `TO:` from the front of the argument.
fn strip_keyword<'a>(argument: &'a str, keyword: &str) -> Option<&'a str> {
    let head = argument.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| argument[keyword.len()..].trim_start())
}

/// Parse `<path> [param ...]`. A bare `user@host` without brackets is
/// tolerated; the empty path `<>` is only legal where `allow_null` is.
fn parse_path(
    rest: &str,
    allow_null: bool,
) -> Result<(EnvelopeAddress, Vec<EsmtpParam>), CommandError> {
    let malformed = || CommandError::MalformedAddress(rest.to_string());

    let (path, tail) = if let Some(inner) = rest.strip_prefix('<') {
        let end = inner.find('>').ok_or_else(malformed)?;
        (&inner[..end], &inner[end + 1..])
    } else {
        match rest.find(char::is_whitespace) {
            Some(at) => (&rest[..at], &rest[at..]),
            None => (rest, ""),
        }
    };

    let address = if path.is_empty() {
        if !allow_null {
            return Err(malformed());
        }
        EnvelopeAddress::null()
    } else {
        EnvelopeAddress::parse(path).ok_or_else(malformed)?
    };

    let params = tail
        .split_whitespace()
        .map(|param| match param.split_once('=') {
            Some((keyword, value)) => EsmtpParam {
                keyword: keyword.to_ascii_uppercase(),
                value: Some(value.to_string()),
            },
            None => EsmtpParam {
                keyword: param.to_ascii_uppercase(),
                value: None,
            },
        })
        .collect();

    Ok((address, params))
}

#[cfg(test)]
mod test {
    use super::*;

    fn string_casing(string: &str) -> impl Iterator<Item = String> {
        let len = string.len();
        let num_cases = usize::pow(2, len as u32);

        let (upper, lower) = string.chars().fold(
            (Vec::with_capacity(len), Vec::with_capacity(len)),
            |(mut upper, mut lower), c| {
                upper.push(c.to_ascii_uppercase());
                lower.push(c.to_ascii_lowercase());
                (upper, lower)
            },
        );

        (0..num_cases).map(move |i| {
            (0..len).fold(String::with_capacity(len), |mut s, idx| {
                if (i & (1 << idx)) == 0 {
                    s.push(lower[idx])
                } else {
                    s.push(upper[idx])
                }
                s
            })
        })
    }

    #[test]
    fn mail_from_command() {
        let command = SmtpCommand::parse(b"MAIL FROM:<a@x.test>").unwrap();
        assert_eq!(command.verb(), Verb::MailFrom);
        match command.parsed() {
            Some(ParsedArgs::MailFrom { sender, params }) => {
                assert_eq!(sender.address(), "a@x.test");
                assert!(params.is_empty());
            }
            other => panic!("unexpected parse: {other:?}"),
        }

        for verb in string_casing("mail") {
            let line = format!("{verb} FrOm:<a@x.test>");
            assert_eq!(
                SmtpCommand::parse(line.as_bytes()).unwrap().verb(),
                Verb::MailFrom
            );
        }
    }

    #[test]
    fn null_sender_is_valid() {
        let command = SmtpCommand::parse(b"MAIL FROM:<>").unwrap();
        match command.parsed() {
            Some(ParsedArgs::MailFrom { sender, .. }) => assert!(sender.is_null()),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn null_recipient_is_not() {
        assert!(matches!(
            SmtpCommand::parse(b"RCPT TO:<>"),
            Err(CommandError::MalformedAddress(_))
        ));
    }

    #[test]
    fn esmtp_params() {
        let command = SmtpCommand::parse(b"MAIL FROM:<a@x.test> SIZE=10240 BODY=8BITMIME").unwrap();
        let parsed = command.parsed().unwrap();

        assert_eq!(
            parsed.param("size").and_then(|p| p.value.as_deref()),
            Some("10240")
        );
        assert_eq!(
            parsed.param("BODY").and_then(|p| p.value.as_deref()),
            Some("8BITMIME")
        );
        assert!(parsed.param("AUTH").is_none());
    }

    #[test]
    fn bare_address_is_tolerated() {
        let command = SmtpCommand::parse(b"RCPT TO: b@y.test").unwrap();
        match command.parsed() {
            Some(ParsedArgs::RcptTo { recipient, .. }) => assert_eq!(recipient.domain(), "y.test"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn malformed_addresses() {
        assert!(SmtpCommand::parse(b"MAIL FROM:").is_err());
        assert!(SmtpCommand::parse(b"MAIL FROM:<unterminated@x.test").is_err());
        assert!(SmtpCommand::parse(b"MAIL SENDER:<a@x.test>").is_err());
        assert!(SmtpCommand::parse("MAIL é".as_bytes()).is_err());
        assert!(SmtpCommand::parse(b"MAIL FROM:<a@b@c>").is_err());
        assert!(SmtpCommand::parse(b"RCPT TO:<not-an-address>").is_err());
        assert!(SmtpCommand::parse(b"RCPT TO:<a b@y.test>").is_err());
    }

    #[test]
    fn line_limits_and_charset() {
        let long = format!("MAIL FROM:<{}@x.test>", "a".repeat(520));
        assert_eq!(
            SmtpCommand::parse(long.as_bytes()),
            Err(CommandError::LineTooLong)
        );

        assert_eq!(
            SmtpCommand::parse(b"NOOP \x01"),
            Err(CommandError::InvalidCharacter)
        );
        assert_eq!(
            SmtpCommand::parse(&[b'N', b'O', b'O', b'P', b' ', 0xff]),
            Err(CommandError::InvalidEncoding)
        );

        // SMTPUTF8: non-ASCII text is fine
        let command = SmtpCommand::parse("VRFY Pelé".as_bytes()).unwrap();
        assert_eq!(command.verb(), Verb::Vrfy);
        assert_eq!(command.argument(), "Pelé");
    }

    #[test]
    fn simple_verbs() {
        for (line, verb) in [
            ("DATA", Verb::Data),
            ("rset", Verb::Rset),
            ("Noop", Verb::Noop),
            ("HELP me", Verb::Help),
            ("quit", Verb::Quit),
            ("StartTLS", Verb::StartTls),
            ("EXPN list", Verb::Unknown),
        ] {
            assert_eq!(SmtpCommand::parse(line.as_bytes()).unwrap().verb(), verb);
        }

        let command = SmtpCommand::parse(b"EHLO client.example").unwrap();
        assert_eq!(command.verb(), Verb::Ehlo);
        assert_eq!(command.argument(), "client.example");

        let command = SmtpCommand::parse(b"FOO bar").unwrap();
        assert_eq!(command.verb(), Verb::Unknown);
        assert_eq!(command.verb_text(), "FOO");
        assert_eq!(command.raw(), "FOO bar");
    }
}
