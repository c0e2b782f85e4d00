//! Phase-typed reply construction.
//!
//! Every hook answers with a [`Reply`] parameterised by the phase it belongs
//! to; the phase carries the RFC-permitted code whitelists as associated
//! consts, so a plugin cannot emit a 550 where only a 421 is legal. The
//! [`Reply::unrestricted`] escape hatch accepts any code in 200..=599.

use core::{fmt::Debug, marker::PhantomData};

/// The disposition a reply encodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Action {
    Accept,
    Defer,
    Reject,
    Raw,
}

/// A wire-ready SMTP reply.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Response {
    code: u16,
    enhanced: Option<String>,
    message: String,
    action: Action,
    close: bool,
}

impl Response {
    fn build(code: u16, message: String, action: Action, close: bool) -> Self {
        Self {
            code,
            enhanced: None,
            message,
            action,
            close,
        }
    }

    /// Construct a reply with any code in 200..=599.
    ///
    /// # Panics
    /// Panics if `code` is outside 200..=599; that is a programming error,
    /// not a runtime condition.
    #[must_use]
    pub fn unrestricted(code: u16, message: impl Into<String>) -> Self {
        assert!(
            (200..=599).contains(&code),
            "SMTP reply code {code} outside 200..=599"
        );
        Self::build(code, message.into(), Action::Raw, false)
    }

    /// Attach an RFC 3463 enhanced status ("x.y.z") to every reply line.
    #[must_use]
    pub fn with_enhanced(mut self, status: &str) -> Self {
        self.enhanced = Some(status.to_string());
        self
    }

    pub(crate) fn mark_close(mut self) -> Self {
        self.close = true;
        self
    }

    #[inline]
    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    #[inline]
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    #[must_use]
    pub fn enhanced(&self) -> Option<&str> {
        self.enhanced.as_deref()
    }

    #[inline]
    #[must_use]
    pub const fn action(&self) -> Action {
        self.action
    }

    /// 2xx or 3xx.
    #[inline]
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code < 400
    }

    /// After a terminal reply the server closes the connection: 421 from
    /// anywhere, any failure out of the Connect phase, and QUIT's 221.
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.close || self.code == 421
    }

    /// Render as wire lines (without CRLF). Embedded `\n` in the message
    /// produces a multiline reply with `-` continuations.
    #[must_use]
    pub fn render(&self) -> Vec<String> {
        let status = self
            .enhanced
            .as_deref()
            .map(|status| format!("{status} "))
            .unwrap_or_default();

        let lines: Vec<&str> = self.message.split('\n').collect();
        let last = lines.len() - 1;

        lines
            .iter()
            .enumerate()
            .map(|(idx, line)| {
                let sep = if idx == last { ' ' } else { '-' };
                format!("{}{}{}{}", self.code, sep, status, line.trim_end_matches('\r'))
            })
            .collect()
    }
}

/// One marker type per protocol phase, carrying its permitted codes.
pub trait ReplyPhase: Debug + Send + Sync + 'static {
    const NAME: &'static str;

    const ACCEPT_DEFAULT: (u16, &'static str);
    const ACCEPT_CODES: &'static [u16];
    const DEFER_DEFAULT: (u16, &'static str);
    const DEFER_CODES: &'static [u16];
    const REJECT_DEFAULT: (u16, &'static str);
    const REJECT_CODES: &'static [u16];

    /// Any non-positive reply closes the connection (the Connect phase).
    const FAILURE_CLOSES: bool = false;
    /// The accepting reply closes the connection (the Quit phase).
    const ACCEPT_CLOSES: bool = false;
}

macro_rules! reply_phase {
    ($(#[$doc:meta])* $name:ident {
        accept: ($acode:expr, $amsg:expr) in $acodes:expr,
        defer: ($dcode:expr, $dmsg:expr) in $dcodes:expr,
        reject: ($rcode:expr, $rmsg:expr) in $rcodes:expr
        $(, $flag:ident: $value:expr)* $(,)?
    }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl ReplyPhase for $name {
            const NAME: &'static str = stringify!($name);

            const ACCEPT_DEFAULT: (u16, &'static str) = ($acode, $amsg);
            const ACCEPT_CODES: &'static [u16] = &$acodes;
            const DEFER_DEFAULT: (u16, &'static str) = ($dcode, $dmsg);
            const DEFER_CODES: &'static [u16] = &$dcodes;
            const REJECT_DEFAULT: (u16, &'static str) = ($rcode, $rmsg);
            const REJECT_CODES: &'static [u16] = &$rcodes;

            $(const $flag: bool = $value;)*
        }
    };
}

reply_phase!(
    /// The greeting. Any failure here closes the connection.
    Connect {
        accept: (220, "Service ready") in [220],
        defer: (421, "Service not available, closing transmission channel") in [421],
        reject: (554, "Transaction failed") in [554],
        FAILURE_CLOSES: true,
    }
);

reply_phase!(Helo {
    accept: (250, "Ok") in [250],
    defer: (450, "Requested action not taken") in [421, 450, 451, 452],
    reject: (550, "Requested action not taken") in [502, 504, 550, 554],
});

reply_phase!(Auth {
    accept: (235, "Authentication successful") in [235],
    defer: (454, "Temporary authentication failure") in [421, 454],
    reject: (535, "Authentication credentials invalid") in [432, 454, 500, 501, 534, 535, 538],
});

reply_phase!(MailFrom {
    accept: (250, "Ok") in [250],
    defer: (450, "Requested mail action not taken: mailbox unavailable") in [450, 451, 452],
    reject: (550, "Requested action not taken: mailbox unavailable") in [550, 551, 552, 553, 554],
});

reply_phase!(RcptTo {
    accept: (250, "Ok") in [250],
    defer: (450, "Requested mail action not taken: mailbox unavailable") in [450, 451, 452],
    reject: (550, "Requested action not taken: mailbox unavailable") in [550, 551, 552, 553, 554],
});

reply_phase!(DataStart {
    accept: (354, "End data with <CR><LF>.<CR><LF>") in [354],
    defer: (451, "Requested action aborted: local error in processing") in [451],
    reject: (554, "Transaction failed") in [503, 554],
});

reply_phase!(DataEnd {
    accept: (250, "Ok") in [250],
    defer: (451, "Requested action aborted: local error in processing") in [451, 452],
    reject: (550, "Requested action not taken") in [550, 552, 554],
});

reply_phase!(
    /// QUIT accepts 221 only; there is no deferral or rejection of a goodbye.
    Quit {
        accept: (221, "Bye") in [221],
        defer: (421, "Service not available") in [],
        reject: (421, "Service not available") in [],
        ACCEPT_CLOSES: true,
    }
);

reply_phase!(Rset {
    accept: (250, "Ok") in [250],
    defer: (421, "Service not available") in [421],
    reject: (500, "Syntax error") in [500, 501, 504],
});

reply_phase!(Noop {
    accept: (250, "Ok") in [250],
    defer: (421, "Service not available") in [421],
    reject: (500, "Syntax error") in [500],
});

reply_phase!(Help {
    accept: (214, "See https://www.rfc-editor.org/rfc/rfc5321") in [211, 214],
    defer: (421, "Service not available") in [421],
    reject: (502, "Command not implemented") in [500, 501, 502, 504],
});

reply_phase!(Vrfy {
    accept: (252, "Cannot VRFY user, but will accept message and attempt delivery")
        in [250, 251, 252],
    defer: (421, "Service not available") in [421],
    reject: (550, "Requested action not taken") in [550, 551, 553],
});

reply_phase!(Unknown {
    accept: (250, "Ok") in [250],
    defer: (421, "Service not available") in [421],
    reject: (500, "Syntax error, command unrecognized") in [500, 501, 502, 504],
});

/// A reply constrained to the codes its phase permits.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Reply<P: ReplyPhase> {
    response: Response,
    _phase: PhantomData<P>,
}

impl<P: ReplyPhase> Reply<P> {
    fn wrap(response: Response) -> Self {
        Self {
            response,
            _phase: PhantomData,
        }
    }

    /// The phase's default accepting reply.
    #[must_use]
    pub fn accept() -> Self {
        let (code, message) = P::ACCEPT_DEFAULT;
        Self::wrap(Response::build(
            code,
            message.to_string(),
            Action::Accept,
            P::ACCEPT_CLOSES,
        ))
    }

    /// Accept with a custom message.
    #[must_use]
    pub fn accept_with(message: impl Into<String>) -> Self {
        let (code, _) = P::ACCEPT_DEFAULT;
        Self::wrap(Response::build(
            code,
            message.into(),
            Action::Accept,
            P::ACCEPT_CLOSES,
        ))
    }

    /// Accept with a non-default code where the phase allows several
    /// (e.g. VRFY 250/251/252).
    ///
    /// # Panics
    /// Panics if `code` is not in the phase's accept whitelist.
    #[must_use]
    pub fn accept_as(code: u16, message: Option<&str>) -> Self {
        assert!(
            P::ACCEPT_CODES.contains(&code),
            "accept code {code} not permitted in {} replies",
            P::NAME
        );
        Self::wrap(Response::build(
            code,
            message.unwrap_or(P::ACCEPT_DEFAULT.1).to_string(),
            Action::Accept,
            P::ACCEPT_CLOSES,
        ))
    }

    /// A transient failure. `None` picks the phase default.
    ///
    /// # Panics
    /// Panics if `code` is not in the phase's defer whitelist.
    #[must_use]
    pub fn defer(code: Option<u16>, message: Option<&str>) -> Self {
        let (default_code, default_message) = P::DEFER_DEFAULT;
        let code = code.unwrap_or(default_code);
        assert!(
            P::DEFER_CODES.contains(&code),
            "defer code {code} not permitted in {} replies",
            P::NAME
        );
        Self::wrap(Response::build(
            code,
            message.unwrap_or(default_message).to_string(),
            Action::Defer,
            P::FAILURE_CLOSES,
        ))
    }

    /// A permanent failure. `None` picks the phase default.
    ///
    /// # Panics
    /// Panics if `code` is not in the phase's reject whitelist.
    #[must_use]
    pub fn reject(code: Option<u16>, message: Option<&str>) -> Self {
        let (default_code, default_message) = P::REJECT_DEFAULT;
        let code = code.unwrap_or(default_code);
        assert!(
            P::REJECT_CODES.contains(&code),
            "reject code {code} not permitted in {} replies",
            P::NAME
        );
        Self::wrap(Response::build(
            code,
            message.unwrap_or(default_message).to_string(),
            Action::Reject,
            P::FAILURE_CLOSES,
        ))
    }

    /// Bypass the whitelist with any code in 200..=599.
    ///
    /// # Panics
    /// Panics if `code` is outside 200..=599.
    #[must_use]
    pub fn unrestricted(code: u16, message: impl Into<String>) -> Self {
        let response = Response::unrestricted(code, message);
        let close = P::FAILURE_CLOSES && !response.is_positive();
        Self::wrap(if close {
            response.mark_close()
        } else {
            response
        })
    }

    /// Attach an enhanced status ("x.y.z").
    #[must_use]
    pub fn enhanced(mut self, status: &str) -> Self {
        self.response = self.response.with_enhanced(status);
        self
    }

    #[must_use]
    pub fn into_response(self) -> Response {
        self.response
    }
}
