//! RFC 5321 envelope addresses, distinct from any RFC 5322 header address
//! inside the message body.

use core::fmt::{self, Display, Formatter};

/// A parsed MAIL FROM / RCPT TO path.
///
/// The empty address is the null reverse-path (`MAIL FROM:<>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeAddress {
    address: String,
    local_part: String,
    domain: String,
}

impl EnvelopeAddress {
    /// The null reverse-path.
    #[must_use]
    pub fn null() -> Self {
        Self {
            address: String::new(),
            local_part: String::new(),
            domain: String::new(),
        }
    }

    /// Parse the text inside an angle-bracket path.
    ///
    /// Source routes (`@relay1,@relay2:user@host`) are accepted and
    /// discarded. `postmaster` without a domain is valid per RFC 5321
    /// section 4.1.1.3. Returns `None` for anything without a single `@`
    /// splitting a non-empty local part and domain, and for whitespace,
    /// control, or angle-bracket characters in either part. Quoted local
    /// parts (`"a b"@host`) are not accepted.
    #[must_use]
    pub fn parse(path: &str) -> Option<Self> {
        // Strip an optional source route
        let path = match path.rfind(':') {
            Some(colon) if path.starts_with('@') => &path[colon + 1..],
            _ => path,
        };

        if path.eq_ignore_ascii_case("postmaster") {
            return Some(Self {
                address: path.to_string(),
                local_part: path.to_string(),
                domain: String::new(),
            });
        }

        let at = path.find('@')?;
        let (local_part, domain) = (&path[..at], &path[at + 1..]);

        if local_part.is_empty() || domain.is_empty() {
            return None;
        }

        let illegal = |c: char| c.is_whitespace() || c.is_control() || matches!(c, '<' | '>' | '"');
        if domain.contains('@') || local_part.chars().any(illegal) || domain.chars().any(illegal) {
            return None;
        }

        Some(Self {
            address: path.to_string(),
            local_part: local_part.to_string(),
            domain: domain.to_string(),
        })
    }

    /// The original textual form of the path.
    #[inline]
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[inline]
    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    #[inline]
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// True for the null reverse-path.
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.address.is_empty()
    }
}

impl Display for EnvelopeAddress {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "<{}>", self.address)
    }
}

/// The transaction envelope of a session: one sender, ordered recipients.
/// Duplicates among recipients are allowed.
#[derive(Default, Debug, Clone)]
pub struct Envelope {
    sender: Option<EnvelopeAddress>,
    recipients: Vec<EnvelopeAddress>,
}

impl Envelope {
    /// The sender, if a MAIL FROM has been accepted. The null sender is
    /// `Some` with [`EnvelopeAddress::is_null`] true.
    #[inline]
    #[must_use]
    pub const fn sender(&self) -> Option<&EnvelopeAddress> {
        self.sender.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn recipients(&self) -> &[EnvelopeAddress] {
        &self.recipients
    }

    pub(crate) fn set_sender(&mut self, sender: EnvelopeAddress) {
        self.sender = Some(sender);
        self.recipients.clear();
    }

    pub(crate) fn push_recipient(&mut self, recipient: EnvelopeAddress) {
        self.recipients.push(recipient);
    }

    /// Drop the whole transaction. Recipients never outlive the sender.
    pub(crate) fn clear(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }
}

#[cfg(test)]
mod test {
    use super::{Envelope, EnvelopeAddress};

    #[test]
    fn parses_plain_address() {
        let addr = EnvelopeAddress::parse("milton.waddams@initech.com").unwrap();
        assert_eq!(addr.local_part(), "milton.waddams");
        assert_eq!(addr.domain(), "initech.com");
        assert_eq!(addr.address(), "milton.waddams@initech.com");
        assert_eq!(addr.to_string(), "<milton.waddams@initech.com>");
        assert!(!addr.is_null());
    }

    #[test]
    fn strips_source_route() {
        let addr = EnvelopeAddress::parse("@relay1.example,@relay2.example:bob@y.test").unwrap();
        assert_eq!(addr.local_part(), "bob");
        assert_eq!(addr.domain(), "y.test");
    }

    #[test]
    fn postmaster_needs_no_domain() {
        let addr = EnvelopeAddress::parse("Postmaster").unwrap();
        assert_eq!(addr.local_part(), "Postmaster");
        assert_eq!(addr.domain(), "");
    }

    #[test]
    fn accepts_utf8_mailboxes() {
        let addr = EnvelopeAddress::parse("Pelé@example.com").unwrap();
        assert_eq!(addr.local_part(), "Pelé");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(EnvelopeAddress::parse("").is_none());
        assert!(EnvelopeAddress::parse("nodomain@").is_none());
        assert!(EnvelopeAddress::parse("@nolocal.com").is_none());
        assert!(EnvelopeAddress::parse("bare-word").is_none());
        assert!(EnvelopeAddress::parse("a@b@c").is_none());
        assert!(EnvelopeAddress::parse("a@dom ain").is_none());
        assert!(EnvelopeAddress::parse("a b@host").is_none());
        assert!(EnvelopeAddress::parse("a\tb@host").is_none());
        assert!(EnvelopeAddress::parse("a\u{1}b@host").is_none());
        assert!(EnvelopeAddress::parse("\"a b\"@host").is_none());
        assert!(EnvelopeAddress::parse("\"ab\"@host").is_none());
        assert!(EnvelopeAddress::parse("a@host\u{7f}").is_none());
    }

    #[test]
    fn recipients_cleared_with_sender() {
        let mut envelope = Envelope::default();
        envelope.set_sender(EnvelopeAddress::parse("a@x.test").unwrap());
        envelope.push_recipient(EnvelopeAddress::parse("b@y.test").unwrap());
        envelope.push_recipient(EnvelopeAddress::parse("b@y.test").unwrap());
        assert_eq!(envelope.recipients().len(), 2);

        // A new sender starts a new transaction
        envelope.set_sender(EnvelopeAddress::parse("c@z.test").unwrap());
        assert!(envelope.recipients().is_empty());

        envelope.clear();
        assert!(envelope.sender().is_none());
    }
}
