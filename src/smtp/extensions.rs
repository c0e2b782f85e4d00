//! ESMTP keywords advertised in the EHLO reply.

use core::fmt::{self, Display};
use std::str::FromStr;

use crate::config::Unfig;

/// SASL mechanisms the AUTH extension offers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mechanism {
    Login,
    Plain,
}

impl Display for Mechanism {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Login => "LOGIN",
            Self::Plain => "PLAIN",
        })
    }
}

impl FromStr for Mechanism {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOGIN" => Ok(Self::Login),
            "PLAIN" => Ok(Self::Plain),
            _ => Err(()),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Extension {
    Pipelining,
    EightBitMime,
    SmtpUtf8,
    Size(usize),
    StartTls,
    Auth(Vec<Mechanism>),
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Pipelining => fmt.write_str("PIPELINING"),
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::SmtpUtf8 => fmt.write_str("SMTPUTF8"),
            Self::Size(limit) => write!(fmt, "SIZE {limit}"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Auth(mechanisms) => {
                fmt.write_str("AUTH")?;
                for mechanism in mechanisms {
                    write!(fmt, " {mechanism}")?;
                }
                Ok(())
            }
        }
    }
}

/// The extension set to advertise for the current connection state.
///
/// STARTTLS disappears once the transport is already TLS; AUTH stays hidden
/// until the transport satisfies `[auth].requireTLS`.
#[must_use]
pub fn advertised(config: &Unfig, secure: bool) -> Vec<Extension> {
    let mut extensions = vec![
        Extension::Pipelining,
        Extension::EightBitMime,
        Extension::SmtpUtf8,
    ];

    if config.smtp.max_message_size > 0 {
        extensions.push(Extension::Size(config.smtp.max_message_size));
    }

    if config.tls.enable_starttls && !secure {
        extensions.push(Extension::StartTls);
    }

    if config.auth.enable && (!config.auth.require_tls || secure) {
        extensions.push(Extension::Auth(vec![Mechanism::Login, Mechanism::Plain]));
    }

    extensions
}
