//! The listener, accept loop, and server lifecycle.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::{net::SocketAddr, time::Duration};

use futures_util::future::join_all;
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle, time::timeout};
use tracing::Instrument;

use crate::{
    config::Unfig,
    context::GlobalContext,
    error::ServerError,
    internal,
    plugin::{Dispatcher, PluginManager},
    smtp::{connection::Connection, machine::Machine, session::Session},
};

/// Broadcast to every open session when a stop is requested.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}

/// An SMTP receiving server: configuration, plugin registry, and shared
/// context, dependency-injected so several servers can coexist in one
/// process.
pub struct Server {
    config: Unfig,
    plugins: PluginManager,
    context: GlobalContext,
}

impl Server {
    #[must_use]
    pub fn new(config: Unfig, plugins: PluginManager) -> Self {
        Self {
            config,
            plugins,
            context: GlobalContext::default(),
        }
    }

    /// Seed the global context before start (e.g. with handles plugins
    /// expect to find).
    #[must_use]
    pub fn with_context(mut self, context: GlobalContext) -> Self {
        self.context = context;
        self
    }

    /// Validate TLS material, bind the listener, and run `on_server_start`
    /// across the registry.
    ///
    /// # Errors
    /// TLS material missing when STARTTLS is enabled, an unbindable listen
    /// address, and plugin start failures all abort here; `on_server_start`
    /// is not invoked unless the socket is ready.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let Self {
            config,
            plugins,
            context,
        } = self;

        let tls = if config.tls.enable_starttls {
            Some(crate::smtp::connection::TlsSettings::load(&config.tls)?)
        } else {
            None
        };

        let address = format!("{}:{}", config.smtp.listen, config.smtp.port);
        let listener = TcpListener::bind((config.smtp.listen.as_str(), config.smtp.port))
            .await
            .map_err(|source| ServerError::Bind { address, source })?;

        let dispatcher = Dispatcher::new(plugins.into_shared(), Arc::new(context));
        dispatcher.server_start().await?;

        internal!(
            level = INFO,
            "UnMTA SMTP server is running on {}:{}",
            config.smtp.listen,
            config.smtp.port
        );

        let (shutdown, stop) = broadcast::channel(16);

        Ok(BoundServer {
            listener,
            config: Arc::new(config),
            dispatcher,
            tls,
            shutdown,
            stop,
            next_id: AtomicU64::new(0),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }
}

/// A server with its socket bound and plugins started; [`serve`](Self::serve)
/// runs the accept loop to completion.
pub struct BoundServer {
    listener: TcpListener,
    config: Arc<Unfig>,
    dispatcher: Dispatcher,
    tls: Option<crate::smtp::connection::TlsSettings>,
    shutdown: broadcast::Sender<Signal>,
    stop: broadcast::Receiver<Signal>,
    next_id: AtomicU64,
    active: Arc<AtomicUsize>,
}

impl BoundServer {
    /// The actually-bound address (useful with port 0).
    ///
    /// # Errors
    /// Propagates the socket error.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle that can request a graceful stop from anywhere.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: self.shutdown.clone(),
        }
    }

    /// Accept connections until a stop is requested, then drain.
    ///
    /// Open sessions get `[smtp].gracefulStopTimeout` seconds to finish;
    /// whatever remains is aborted. `on_server_stop` fires once, after the
    /// drain.
    ///
    /// # Errors
    /// Returns an error if the listener fails.
    pub async fn serve(self) -> Result<(), ServerError> {
        let Self {
            listener,
            config,
            dispatcher,
            tls,
            shutdown,
            mut stop,
            next_id,
            active,
        } = self;

        let mut sessions: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    internal!(level = INFO, "Stop requested, finishing sessions ...");
                    break;
                }

                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    sessions.retain(|handle| !handle.is_finished());

                    let id = next_id.fetch_add(1, Ordering::Relaxed) + 1;
                    let open = active.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::debug!(target: "unmta", "Accepted connection {id} from {peer} ({open} active)");

                    let session = Session::new(id, open, peer, false);
                    let machine = Machine::new(
                        Connection::plain(stream),
                        session,
                        dispatcher.clone(),
                        Arc::clone(&config),
                        tls.clone(),
                    );

                    let signal = shutdown.subscribe();
                    let counter = Arc::clone(&active);
                    let span = tracing::span!(
                        target: "unmta",
                        tracing::Level::INFO,
                        "session",
                        id,
                        peer = %peer
                    );

                    sessions.push(tokio::spawn(
                        async move {
                            if let Err(err) = machine.run(signal).await {
                                internal!(level = ERROR, "Session ended with error: {err}");
                            }
                            counter.fetch_sub(1, Ordering::SeqCst);
                        }
                        .instrument(span),
                    ));
                }
            }
        }

        // Stop accepting before draining
        drop(listener);

        let grace = Duration::from_secs(config.smtp.graceful_stop_timeout);
        if timeout(grace, join_all(sessions.iter_mut())).await.is_err() {
            let open = sessions.iter().filter(|handle| !handle.is_finished()).count();
            internal!(level = WARN, "Graceful stop timed out, aborting {open} open sessions");
            for handle in &sessions {
                handle.abort();
            }
        }

        dispatcher.server_stop().await;
        internal!(level = INFO, "UnMTA SMTP server stopped");

        Ok(())
    }
}

/// Clonable stop trigger for a running server.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: broadcast::Sender<Signal>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.sender.send(Signal::Shutdown);
    }
}
