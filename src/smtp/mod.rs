pub mod command;
pub mod connection;
pub mod envelope;
pub mod extensions;
pub mod machine;
pub mod response;
pub mod session;

use core::fmt::{self, Display, Formatter};

/// The coarse stage of an RFC 5321 conversation. Gates which verbs are legal
/// and which reply phase a hook may answer with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum SessionPhase {
    #[default]
    Connection,
    Auth,
    Helo,
    Sender,
    Recipient,
    Data,
    PostData,
}

impl Display for SessionPhase {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Connection => "connection",
            Self::Auth => "auth",
            Self::Helo => "helo",
            Self::Sender => "sender",
            Self::Recipient => "recipient",
            Self::Data => "data",
            Self::PostData => "postdata",
        })
    }
}

/// Which greeting form the client used.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Greeting {
    Helo,
    Ehlo,
}

impl Display for Greeting {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
        })
    }
}
