//! The plugin dispatch engine.
//!
//! Plugins are named bundles of hook handlers, registered once and invoked
//! in registration order for every hook. The first handler to return a reply
//! wins; later handlers never see the event. A failed handler is logged and
//! treated as "no reply" — a plugin must never take the server down.

use std::{any::Any, ops::Deref, sync::Arc};

use async_trait::async_trait;

use crate::{
    context::GlobalContext,
    error::ServerError,
    internal,
    smtp::{
        command::SmtpCommand,
        envelope::EnvelopeAddress,
        response::{self, Reply, Response},
        session::{DataStream, Session},
        Greeting,
    },
};

/// What a hook handler may produce: nothing (continue the chain), a reply
/// typed for the hook's phase (short-circuit), or an error (logged, chain
/// continues).
pub type HookOutcome<P> = anyhow::Result<Option<Reply<P>>>;

/// The invocation frame handed to every hook handler.
///
/// Carries the invoking plugin's identity, so writes land in that plugin's
/// namespace and nowhere else; reads may cross namespaces. Server-owned
/// session fields are reachable read-only through `Deref`.
pub struct HookSession<'a> {
    session: &'a mut Session,
    plugin: &'a str,
    global: &'a GlobalContext,
}

impl<'a> HookSession<'a> {
    pub(crate) fn new(session: &'a mut Session, plugin: &'a str, global: &'a GlobalContext) -> Self {
        Self {
            session,
            plugin,
            global,
        }
    }

    /// The name this frame writes under.
    #[inline]
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        self.plugin
    }

    /// Process-wide shared state.
    #[inline]
    #[must_use]
    pub fn global(&self) -> &GlobalContext {
        self.global
    }

    /// Store a value under the invoking plugin's namespace.
    pub fn set_own_data<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.session
            .set_plugin_data(self.plugin, key.into(), Arc::new(value));
    }

    /// Read back from the invoking plugin's namespace.
    #[must_use]
    pub fn get_own_data<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.session.plugin_data(self.plugin, key)
    }

    /// Read from any plugin's namespace.
    #[must_use]
    pub fn get_data<T: Any + Send + Sync>(&self, plugin: &str, key: &str) -> Option<Arc<T>> {
        self.session.plugin_data(plugin, key)
    }
}

impl Deref for HookSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

/// A named bundle of hook handlers. Every handler has a no-op default, so a
/// plugin implements exactly the hooks it cares about.
///
/// Handlers for one session run strictly sequentially; a handler must not
/// spawn background work that touches the session after it returns.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name; doubles as the session-data namespace and the
    /// `[plugins.<name>]` config key.
    fn name(&self) -> &str;

    async fn on_connect(&self, _session: &mut HookSession<'_>) -> HookOutcome<response::Connect> {
        Ok(None)
    }

    async fn on_helo(
        &self,
        _session: &mut HookSession<'_>,
        _hostname: &str,
        _verb: Greeting,
    ) -> HookOutcome<response::Helo> {
        Ok(None)
    }

    /// Credentials arrive base64-decoded; undecodable input never reaches
    /// this hook.
    async fn on_auth(
        &self,
        _session: &mut HookSession<'_>,
        _username: &str,
        _password: &str,
    ) -> HookOutcome<response::Auth> {
        Ok(None)
    }

    /// `sender` is `None` for the null reverse-path `MAIL FROM:<>`.
    async fn on_mail_from(
        &self,
        _session: &mut HookSession<'_>,
        _sender: Option<&EnvelopeAddress>,
        _command: &SmtpCommand,
    ) -> HookOutcome<response::MailFrom> {
        Ok(None)
    }

    async fn on_rcpt_to(
        &self,
        _session: &mut HookSession<'_>,
        _recipient: &EnvelopeAddress,
        _command: &SmtpCommand,
    ) -> HookOutcome<response::RcptTo> {
        Ok(None)
    }

    async fn on_data_start(
        &self,
        _session: &mut HookSession<'_>,
    ) -> HookOutcome<response::DataStart> {
        Ok(None)
    }

    /// `data` is the dot-unstuffed payload; the machine closes it once the
    /// chain settles.
    async fn on_data_end(
        &self,
        _session: &mut HookSession<'_>,
        _data: &mut DataStream,
    ) -> HookOutcome<response::DataEnd> {
        Ok(None)
    }

    async fn on_quit(&self, _session: &mut HookSession<'_>) -> HookOutcome<response::Quit> {
        Ok(None)
    }

    /// Fired exactly once as the session is torn down. The socket may
    /// already be gone, so there is nothing to reply to.
    async fn on_close(&self, _session: &mut HookSession<'_>) {}

    async fn on_rset(&self, _session: &mut HookSession<'_>) -> HookOutcome<response::Rset> {
        Ok(None)
    }

    async fn on_help(&self, _session: &mut HookSession<'_>) -> HookOutcome<response::Help> {
        Ok(None)
    }

    async fn on_noop(&self, _session: &mut HookSession<'_>) -> HookOutcome<response::Noop> {
        Ok(None)
    }

    async fn on_vrfy(
        &self,
        _session: &mut HookSession<'_>,
        _command: &SmtpCommand,
    ) -> HookOutcome<response::Vrfy> {
        Ok(None)
    }

    async fn on_unknown(
        &self,
        _session: &mut HookSession<'_>,
        _command: &SmtpCommand,
    ) -> HookOutcome<response::Unknown> {
        Ok(None)
    }

    /// Awaited before the server starts accepting; an error aborts startup.
    async fn on_server_start(&self, _context: &GlobalContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Awaited once every session has drained (or the stop timeout fired).
    async fn on_server_stop(&self, _context: &GlobalContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The ordered plugin registry. Consumed by the server at construction;
/// registration after start is unrepresentable.
#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    /// Append plugins in call order, which fixes their hook order.
    ///
    /// # Errors
    /// Rejects a duplicate plugin name; namespaces would collide.
    pub fn load_plugins(
        &mut self,
        plugins: impl IntoIterator<Item = Arc<dyn Plugin>>,
    ) -> Result<(), ServerError> {
        for plugin in plugins {
            if self.plugins.iter().any(|p| p.name() == plugin.name()) {
                return Err(ServerError::DuplicatePlugin(plugin.name().to_string()));
            }
            self.plugins.push(plugin);
        }

        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub(crate) fn into_shared(self) -> Arc<[Arc<dyn Plugin>]> {
        self.plugins.into()
    }
}

/// Invoke `$hook` across the chain: registration order, first reply wins,
/// errors swallowed and logged.
macro_rules! drive {
    ($self:ident, $session:ident, $hook:ident $(, $arg:expr)*) => {{
        let mut decided = None;

        for plugin in $self.plugins.iter() {
            let mut frame = HookSession::new($session, plugin.name(), &$self.global);

            match plugin.$hook(&mut frame $(, $arg)*).await {
                Ok(Some(reply)) => {
                    decided = Some(reply.into_response());
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    internal!(
                        level = ERROR,
                        "Plugin '{}' failed in {}: {err:#}",
                        plugin.name(),
                        stringify!($hook)
                    );
                }
            }
        }

        decided
    }};
}

/// Per-server hook dispatcher: the registry plus the global context, shared
/// by every session.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    plugins: Arc<[Arc<dyn Plugin>]>,
    global: Arc<GlobalContext>,
}

impl Dispatcher {
    pub(crate) fn new(plugins: Arc<[Arc<dyn Plugin>]>, global: Arc<GlobalContext>) -> Self {
        Self { plugins, global }
    }

    pub(crate) async fn on_connect(&self, session: &mut Session) -> Option<Response> {
        drive!(self, session, on_connect)
    }

    pub(crate) async fn on_helo(
        &self,
        session: &mut Session,
        hostname: &str,
        verb: Greeting,
    ) -> Option<Response> {
        drive!(self, session, on_helo, hostname, verb)
    }

    pub(crate) async fn on_auth(
        &self,
        session: &mut Session,
        username: &str,
        password: &str,
    ) -> Option<Response> {
        drive!(self, session, on_auth, username, password)
    }

    pub(crate) async fn on_mail_from(
        &self,
        session: &mut Session,
        sender: Option<&EnvelopeAddress>,
        command: &SmtpCommand,
    ) -> Option<Response> {
        drive!(self, session, on_mail_from, sender, command)
    }

    pub(crate) async fn on_rcpt_to(
        &self,
        session: &mut Session,
        recipient: &EnvelopeAddress,
        command: &SmtpCommand,
    ) -> Option<Response> {
        drive!(self, session, on_rcpt_to, recipient, command)
    }

    pub(crate) async fn on_data_start(&self, session: &mut Session) -> Option<Response> {
        drive!(self, session, on_data_start)
    }

    pub(crate) async fn on_data_end(
        &self,
        session: &mut Session,
        data: &mut DataStream,
    ) -> Option<Response> {
        drive!(self, session, on_data_end, data)
    }

    pub(crate) async fn on_quit(&self, session: &mut Session) -> Option<Response> {
        drive!(self, session, on_quit)
    }

    pub(crate) async fn on_rset(&self, session: &mut Session) -> Option<Response> {
        drive!(self, session, on_rset)
    }

    pub(crate) async fn on_help(&self, session: &mut Session) -> Option<Response> {
        drive!(self, session, on_help)
    }

    pub(crate) async fn on_noop(&self, session: &mut Session) -> Option<Response> {
        drive!(self, session, on_noop)
    }

    pub(crate) async fn on_vrfy(
        &self,
        session: &mut Session,
        command: &SmtpCommand,
    ) -> Option<Response> {
        drive!(self, session, on_vrfy, command)
    }

    pub(crate) async fn on_unknown(
        &self,
        session: &mut Session,
        command: &SmtpCommand,
    ) -> Option<Response> {
        drive!(self, session, on_unknown, command)
    }

    /// Unlike the reply-bearing hooks, every plugin hears about the close;
    /// the socket is already gone, so there is nothing to short-circuit.
    pub(crate) async fn on_close(&self, session: &mut Session) {
        for plugin in self.plugins.iter() {
            let mut frame = HookSession::new(session, plugin.name(), &self.global);
            plugin.on_close(&mut frame).await;
        }
    }

    pub(crate) async fn server_start(&self) -> Result<(), ServerError> {
        for plugin in self.plugins.iter() {
            plugin
                .on_server_start(&self.global)
                .await
                .map_err(|reason| ServerError::PluginStart {
                    plugin: plugin.name().to_string(),
                    reason,
                })?;
        }

        Ok(())
    }

    pub(crate) async fn server_stop(&self) {
        for plugin in self.plugins.iter() {
            if let Err(err) = plugin.on_server_stop(&self.global).await {
                internal!(
                    level = ERROR,
                    "Plugin '{}' failed in on_server_stop: {err:#}",
                    plugin.name()
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use super::*;
    use crate::smtp::response::RcptTo;

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        calls: Arc<Mutex<Vec<&'static str>>>,
        reply: bool,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_rcpt_to(
            &self,
            session: &mut HookSession<'_>,
            _recipient: &EnvelopeAddress,
            _command: &SmtpCommand,
        ) -> HookOutcome<RcptTo> {
            self.calls.lock().unwrap().push(self.name);
            session.set_own_data("seen", true);

            if self.fail {
                anyhow::bail!("backend unreachable");
            }

            Ok(self
                .reply
                .then(|| Reply::unrestricted(421, "Out of capacity")))
        }
    }

    fn rcpt_command() -> SmtpCommand {
        SmtpCommand::parse(b"RCPT TO:<b@y.test>").unwrap()
    }

    fn session() -> Session {
        Session::new(1, 1, "192.0.2.1:9999".parse().unwrap(), false)
    }

    fn dispatcher(plugins: Vec<Arc<dyn Plugin>>) -> Dispatcher {
        let mut manager = PluginManager::default();
        manager.load_plugins(plugins).unwrap();
        Dispatcher::new(manager.into_shared(), Arc::default())
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut manager = PluginManager::default();
        let result = manager.load_plugins([
            Arc::new(Recorder {
                name: "twin",
                ..Recorder::default()
            }) as Arc<dyn Plugin>,
            Arc::new(Recorder {
                name: "twin",
                ..Recorder::default()
            }),
        ]);

        assert!(matches!(result, Err(ServerError::DuplicatePlugin(name)) if name == "twin"));
    }

    #[tokio::test]
    async fn chain_runs_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(vec![
            Arc::new(Recorder {
                name: "a",
                calls: Arc::clone(&calls),
                ..Recorder::default()
            }),
            Arc::new(Recorder {
                name: "b",
                calls: Arc::clone(&calls),
                ..Recorder::default()
            }),
        ]);

        let mut session = session();
        let recipient = EnvelopeAddress::parse("b@y.test").unwrap();
        let decided = dispatcher
            .on_rcpt_to(&mut session, &recipient, &rcpt_command())
            .await;

        assert!(decided.is_none());
        assert_eq!(*calls.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn first_reply_short_circuits() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(vec![
            Arc::new(Recorder {
                name: "deny",
                calls: Arc::clone(&calls),
                reply: true,
                ..Recorder::default()
            }),
            Arc::new(Recorder {
                name: "never",
                calls: Arc::clone(&calls),
                ..Recorder::default()
            }),
        ]);

        let mut session = session();
        let recipient = EnvelopeAddress::parse("b@y.test").unwrap();
        let decided = dispatcher
            .on_rcpt_to(&mut session, &recipient, &rcpt_command())
            .await;

        assert_eq!(decided.map(|r| r.code()), Some(421));
        assert_eq!(*calls.lock().unwrap(), vec!["deny"]);
    }

    #[tokio::test]
    async fn handler_errors_continue_the_chain() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(vec![
            Arc::new(Recorder {
                name: "flaky",
                calls: Arc::clone(&calls),
                fail: true,
                ..Recorder::default()
            }),
            Arc::new(Recorder {
                name: "steady",
                calls: Arc::clone(&calls),
                ..Recorder::default()
            }),
        ]);

        let mut session = session();
        let recipient = EnvelopeAddress::parse("b@y.test").unwrap();
        let decided = dispatcher
            .on_rcpt_to(&mut session, &recipient, &rcpt_command())
            .await;

        assert!(decided.is_none());
        assert_eq!(*calls.lock().unwrap(), vec!["flaky", "steady"]);
    }

    #[tokio::test]
    async fn writes_are_scoped_to_the_writer() {
        let dispatcher = dispatcher(vec![
            Arc::new(Recorder {
                name: "a",
                ..Recorder::default()
            }),
            Arc::new(Recorder {
                name: "b",
                ..Recorder::default()
            }),
        ]);

        let mut session = session();
        let recipient = EnvelopeAddress::parse("b@y.test").unwrap();
        dispatcher
            .on_rcpt_to(&mut session, &recipient, &rcpt_command())
            .await;

        assert_eq!(session.plugin_data::<bool>("a", "seen").as_deref(), Some(&true));
        assert_eq!(session.plugin_data::<bool>("b", "seen").as_deref(), Some(&true));
        assert!(session.plugin_data::<bool>("a", "other").is_none());
    }

    #[tokio::test]
    async fn server_start_failure_names_the_plugin() {
        struct Doomed;

        #[async_trait]
        impl Plugin for Doomed {
            fn name(&self) -> &str {
                "doomed"
            }

            async fn on_server_start(&self, _context: &GlobalContext) -> anyhow::Result<()> {
                anyhow::bail!("no database")
            }
        }

        static CALLS: AtomicUsize = AtomicUsize::new(0);
        struct Counts;

        #[async_trait]
        impl Plugin for Counts {
            fn name(&self) -> &str {
                "counts"
            }

            async fn on_server_start(&self, _context: &GlobalContext) -> anyhow::Result<()> {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let dispatcher = dispatcher(vec![Arc::new(Doomed), Arc::new(Counts)]);
        let result = dispatcher.server_start().await;

        assert!(matches!(
            result,
            Err(ServerError::PluginStart { plugin, .. }) if plugin == "doomed"
        ));
        // The chain stops at the failure
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    }
}
