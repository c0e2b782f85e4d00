//! The per-connection data record and its plugin-scoped sub-stores.

use std::{
    any::Any,
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use super::{
    envelope::{Envelope, EnvelopeAddress},
    Greeting, SessionPhase,
};

/// A value stored under a plugin's namespace in the session.
pub type PluginValue = Arc<dyn Any + Send + Sync>;

/// One session per accepted TCP connection; destroyed when the socket
/// closes. Server-owned fields are read-only to plugins — mutation happens
/// through the protocol machine, and plugin writes are confined to the
/// writer's own namespace by [`HookSession`](crate::plugin::HookSession).
pub struct Session {
    id: u64,
    active_connections: usize,
    start_time: u64,
    remote_address: String,
    phase: SessionPhase,
    greeting: Option<Greeting>,
    helo_host: Option<String>,
    secure: bool,
    authenticated: bool,
    data_mode: bool,
    envelope: Envelope,
    plugin_data: HashMap<String, HashMap<String, PluginValue>>,
}

impl Session {
    pub(crate) fn new(id: u64, active_connections: usize, peer: SocketAddr, secure: bool) -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        Self {
            id,
            active_connections,
            start_time,
            remote_address: peer.ip().to_string(),
            phase: SessionPhase::Connection,
            greeting: None,
            helo_host: None,
            secure,
            authenticated: false,
            data_mode: false,
            envelope: Envelope::default(),
            plugin_data: HashMap::new(),
        }
    }

    /// Monotonic id, unique for the server's lifetime.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The server's open-connection count as observed at accept.
    #[inline]
    #[must_use]
    pub const fn active_connections(&self) -> usize {
        self.active_connections
    }

    /// Wall-clock millisecond timestamp of accept.
    #[inline]
    #[must_use]
    pub const fn start_time(&self) -> u64 {
        self.start_time
    }

    /// The client IP in textual form.
    #[inline]
    #[must_use]
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    #[inline]
    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// `None` until the client greets; survives RSET.
    #[inline]
    #[must_use]
    pub const fn greeting(&self) -> Option<Greeting> {
        self.greeting
    }

    /// The hostname the client claimed in HELO/EHLO.
    #[inline]
    #[must_use]
    pub fn helo_host(&self) -> Option<&str> {
        self.helo_host.as_deref()
    }

    /// True once the transport is TLS.
    #[inline]
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.secure
    }

    /// True once AUTH succeeded on this connection; survives RSET.
    #[inline]
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// True only while the server is consuming DATA payload octets.
    #[inline]
    #[must_use]
    pub const fn is_data_mode(&self) -> bool {
        self.data_mode
    }

    #[inline]
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    #[inline]
    #[must_use]
    pub fn sender(&self) -> Option<&EnvelopeAddress> {
        self.envelope.sender()
    }

    #[inline]
    #[must_use]
    pub fn recipients(&self) -> &[EnvelopeAddress] {
        self.envelope.recipients()
    }

    /// Read a value from any plugin's namespace.
    #[must_use]
    pub fn plugin_data<T: Any + Send + Sync>(&self, plugin: &str, key: &str) -> Option<Arc<T>> {
        self.plugin_data
            .get(plugin)?
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub(crate) fn set_plugin_data(&mut self, plugin: &str, key: String, value: PluginValue) {
        self.plugin_data
            .entry(plugin.to_string())
            .or_default()
            .insert(key, value);
    }

    pub(crate) fn set_phase(&mut self, phase: SessionPhase) {
        self.phase = phase;
    }

    pub(crate) fn set_greeting(&mut self, greeting: Greeting, host: &str) {
        self.greeting = Some(greeting);
        self.helo_host = Some(host.to_string());
    }

    pub(crate) fn set_authenticated(&mut self) {
        self.authenticated = true;
    }

    pub(crate) fn set_data_mode(&mut self, on: bool) {
        self.data_mode = on;
    }

    pub(crate) fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    /// RSET semantics: the transaction goes, identity stays.
    pub(crate) fn reset_transaction(&mut self) {
        self.envelope.clear();
        self.data_mode = false;
    }

    /// Post-STARTTLS semantics (RFC 3207): everything learned before the
    /// handshake is discarded, and the client must greet again.
    pub(crate) fn reset_for_tls(&mut self) {
        self.reset_transaction();
        self.greeting = None;
        self.helo_host = None;
        self.authenticated = false;
        self.secure = true;
        self.phase = SessionPhase::Connection;
    }
}

/// The dot-unstuffed DATA payload, exposed to `on_data_end` as a pull
/// reader. Closed by the machine once the hook chain settles.
pub struct DataStream {
    bytes: Vec<u8>,
    pos: usize,
    closed: bool,
}

impl DataStream {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            pos: 0,
            closed: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The whole payload, CRLF line endings preserved.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Pull up to `buf.len()` octets. Returns 0 at end-of-stream or after
    /// close.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.closed {
            return 0;
        }

        let n = buf.len().min(self.bytes.len() - self.pos);
        buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    #[inline]
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    fn session() -> Session {
        Session::new(7, 3, "192.0.2.7:40000".parse().unwrap(), false)
    }

    #[test]
    fn snapshot_fields() {
        let session = session();
        assert_eq!(session.id(), 7);
        assert_eq!(session.active_connections(), 3);
        assert_eq!(session.remote_address(), "192.0.2.7");
        assert_eq!(session.phase(), SessionPhase::Connection);
        assert!(session.greeting().is_none());
        assert!(!session.is_secure());
        assert!(!session.is_authenticated());
        assert!(session.start_time() > 0);
    }

    #[test]
    fn plugin_data_is_namespaced() {
        let mut session = session();
        session.set_plugin_data("spamcheck", "score".to_string(), Arc::new(0.7_f64));
        session.set_plugin_data("greylist", "score".to_string(), Arc::new(42_u32));

        assert_eq!(
            session.plugin_data::<f64>("spamcheck", "score").as_deref(),
            Some(&0.7)
        );
        assert_eq!(
            session.plugin_data::<u32>("greylist", "score").as_deref(),
            Some(&42)
        );
        // Reads across namespaces are allowed, but keys do not leak
        assert!(session.plugin_data::<f64>("greylist", "score").is_none());
        assert!(session.plugin_data::<f64>("absent", "score").is_none());
    }

    #[test]
    fn rset_keeps_identity() {
        let mut session = session();
        session.set_greeting(Greeting::Ehlo, "client.example");
        session.set_authenticated();
        session
            .envelope_mut()
            .set_sender(EnvelopeAddress::parse("a@x.test").unwrap());
        session
            .envelope_mut()
            .push_recipient(EnvelopeAddress::parse("b@y.test").unwrap());

        session.reset_transaction();

        assert!(session.sender().is_none());
        assert!(session.recipients().is_empty());
        assert_eq!(session.greeting(), Some(Greeting::Ehlo));
        assert!(session.is_authenticated());
    }

    #[test]
    fn tls_reset_discards_everything() {
        let mut session = session();
        session.set_greeting(Greeting::Ehlo, "client.example");
        session.set_authenticated();

        session.reset_for_tls();

        assert!(session.greeting().is_none());
        assert!(!session.is_authenticated());
        assert!(session.is_secure());
        assert_eq!(session.phase(), SessionPhase::Connection);
    }

    #[test]
    fn data_stream_pulls_and_closes() {
        let mut stream = DataStream::new(b"Subject: t\r\n\r\nhi\r\n".to_vec());
        assert_eq!(stream.len(), 18);

        let mut buf = [0_u8; 10];
        assert_eq!(stream.read(&mut buf), 10);
        assert_eq!(&buf, b"Subject: t");
        assert_eq!(stream.read(&mut buf), 8);
        assert_eq!(stream.read(&mut buf), 0);

        let mut stream = DataStream::new(b"unread".to_vec());
        stream.close();
        assert!(stream.is_closed());
        assert_eq!(stream.read(&mut buf), 0);
    }
}
