//! The per-connection protocol driver.
//!
//! Reads command lines, gates them by phase, runs the hook chain, and writes
//! the settled reply. Out-of-phase verbs are answered 503 without any plugin
//! dispatch. DATA octets bypass the command parser entirely.

use std::{io, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
    time::timeout,
};

use crate::{
    config::Unfig,
    error::SessionError,
    incoming, internal, outgoing,
    plugin::Dispatcher,
    server::Signal,
    smtp::{
        command::{CommandError, ParsedArgs, SmtpCommand, Verb, MAX_LINE_OCTETS},
        connection::{Connection, LineOutcome, TlsSettings},
        extensions::{self, Mechanism},
        response::{self, Reply, Response},
        session::{DataStream, Session},
        Greeting, SessionPhase,
    },
};

/// Slack past the configured maximum before the reader stops buffering an
/// oversize DATA payload and merely scans for the terminator.
const OVERSIZE_SLACK: usize = 1024;

/// What the command loop should do after a command settles.
enum Step {
    Continue,
    Close,
    /// STARTTLS was accepted; the caller owns the transport swap.
    Upgrade,
}

/// What a wait on the socket produced.
enum Wait {
    Stop,
    TimedOut,
    Io(io::Result<LineOutcome>),
}

/// Outcome of consuming a DATA payload.
enum Payload {
    /// Dot-unstuffed message body.
    Complete(Vec<u8>),
    /// The body exceeded `[smtp].maxMessageSize`.
    Oversize,
    Eof,
}

/// Result of an AUTH credential exchange.
enum AuthExchange {
    Credentials(String, String),
    Abort(Response),
    Eof,
}

pub(crate) struct Machine<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    connection: Connection<Stream>,
    session: Session,
    dispatcher: Dispatcher,
    config: Arc<Unfig>,
    tls: Option<TlsSettings>,
    stopping: bool,
}

fn bad_sequence() -> Response {
    Response::unrestricted(503, "Bad sequence of commands").with_enhanced("5.5.1")
}

fn syntax_error() -> Response {
    Response::unrestricted(500, "Syntax error").with_enhanced("5.5.2")
}

/// Remove SMTP transparency: one leading dot per line is dropped; CRLFs are
/// preserved untouched.
fn unstuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut at_line_start = true;
    let mut i = 0;

    while i < payload.len() {
        let byte = payload[i];
        i += 1;

        if at_line_start && byte == b'.' {
            at_line_start = false;
            continue;
        }

        out.push(byte);
        at_line_start = byte == b'\n';
    }

    out
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Machine<Stream> {
    pub(crate) fn new(
        connection: Connection<Stream>,
        session: Session,
        dispatcher: Dispatcher,
        config: Arc<Unfig>,
        tls: Option<TlsSettings>,
    ) -> Self {
        Self {
            connection,
            session,
            dispatcher,
            config,
            tls,
            stopping: false,
        }
    }

    fn hostname(&self) -> &str {
        &self.config.smtp.hostname
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.smtp.inactivity_timeout)
    }

    /// Drive the session to completion. `on_close` fires exactly once, after
    /// everything else, whatever path ended the conversation.
    pub(crate) async fn run(
        mut self,
        mut signal: broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Connected to {}", self.session.remote_address());

        let result = self.converse(&mut signal).await;

        internal!("Connection closed");
        self.dispatcher.on_close(&mut self.session).await;

        result
    }

    async fn converse(
        &mut self,
        signal: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let greeting = match self.dispatcher.on_connect(&mut self.session).await {
            Some(response) => response,
            None => Response::unrestricted(220, format!("{} ESMTP UnMTA", self.hostname())),
        };

        if self.reply(&greeting).await? || !greeting.is_positive() {
            return Ok(());
        }

        loop {
            if self.stopping {
                let response = Response::unrestricted(
                    421,
                    format!("{} Service not available, server is shutting down", self.hostname()),
                )
                .with_enhanced("4.3.0");
                self.reply(&response).await?;
                return Ok(());
            }

            let wait = tokio::select! {
                _ = signal.recv() => Wait::Stop,
                result = timeout(self.idle_timeout(), self.connection.read_line(MAX_LINE_OCTETS)) => {
                    match result {
                        Ok(io) => Wait::Io(io),
                        Err(_) => Wait::TimedOut,
                    }
                }
            };

            let line = match wait {
                Wait::Stop => {
                    self.stopping = true;
                    continue;
                }
                Wait::TimedOut => return self.timed_out().await,
                Wait::Io(io) => match io? {
                    LineOutcome::Eof => return Ok(()),
                    LineOutcome::TooLong => {
                        let response = Response::unrestricted(500, "Line too long")
                            .with_enhanced("5.5.2");
                        self.reply(&response).await?;
                        continue;
                    }
                    LineOutcome::Line(line) => line,
                },
            };

            incoming!("{}", String::from_utf8_lossy(&line));

            let command = match SmtpCommand::parse(&line) {
                Ok(command) => command,
                Err(CommandError::MalformedAddress(_)) => {
                    let response = Response::unrestricted(501, "Bad address syntax")
                        .with_enhanced("5.5.4");
                    self.reply(&response).await?;
                    continue;
                }
                Err(_) => {
                    self.reply(&syntax_error()).await?;
                    continue;
                }
            };

            match self.handle(command).await? {
                Step::Continue => {}
                Step::Close => return Ok(()),
                Step::Upgrade => self.upgrade().await?,
            }
        }
    }

    async fn timed_out(&mut self) -> Result<(), SessionError> {
        let seconds = self.config.smtp.inactivity_timeout;
        let response = Response::unrestricted(
            421,
            format!("{} Connection timed out due to inactivity", self.hostname()),
        )
        .with_enhanced("4.4.2");

        // Best effort; the peer may be long gone
        let _ = self.reply(&response).await;
        Err(SessionError::Timeout(seconds))
    }

    /// Send every rendered line of a reply. Returns whether the reply is
    /// terminal for the connection.
    async fn reply(&mut self, response: &Response) -> Result<bool, SessionError> {
        for line in response.render() {
            outgoing!("{line}");
            self.connection.send_line(&line).await?;
        }

        Ok(response.is_terminal())
    }

    async fn finish(&mut self, response: Response) -> Result<Step, SessionError> {
        Ok(if self.reply(&response).await? {
            Step::Close
        } else {
            Step::Continue
        })
    }

    async fn handle(&mut self, command: SmtpCommand) -> Result<Step, SessionError> {
        match command.verb() {
            Verb::Helo | Verb::Ehlo => self.cmd_helo(&command).await,
            Verb::Auth => self.cmd_auth(&command).await,
            Verb::MailFrom => self.cmd_mail(&command).await,
            Verb::RcptTo => self.cmd_rcpt(&command).await,
            Verb::Data => self.cmd_data().await,
            Verb::Rset => self.cmd_rset().await,
            Verb::Noop => self.cmd_noop().await,
            Verb::Help => self.cmd_help().await,
            Verb::Vrfy => self.cmd_vrfy(&command).await,
            Verb::Quit => self.cmd_quit().await,
            Verb::StartTls => self.cmd_starttls().await,
            Verb::Unknown => self.cmd_unknown(&command).await,
        }
    }

    async fn cmd_helo(&mut self, command: &SmtpCommand) -> Result<Step, SessionError> {
        let verb = if command.verb() == Verb::Ehlo {
            Greeting::Ehlo
        } else {
            Greeting::Helo
        };

        let host = command.argument().to_string();
        if host.is_empty() {
            let response =
                Response::unrestricted(501, format!("{verb} requires a domain")).with_enhanced("5.5.4");
            return self.finish(response).await;
        }

        let decided = self.dispatcher.on_helo(&mut self.session, &host, verb).await;
        let response = decided.unwrap_or_else(|| match verb {
            Greeting::Helo => Response::unrestricted(250, self.hostname().to_string()),
            Greeting::Ehlo => {
                let mut lines = vec![self.hostname().to_string()];
                lines.extend(
                    extensions::advertised(&self.config, self.session.is_secure())
                        .iter()
                        .map(ToString::to_string),
                );
                lines.push("HELP".to_string());
                Response::unrestricted(250, lines.join("\n"))
            }
        });

        if response.is_positive() {
            // A repeated greeting resets the transaction exactly like RSET
            self.session.reset_transaction();
            self.session.set_greeting(verb, &host);
            self.session.set_phase(SessionPhase::Helo);
        }

        self.finish(response).await
    }

    async fn cmd_auth(&mut self, command: &SmtpCommand) -> Result<Step, SessionError> {
        if !self.config.auth.enable {
            let response =
                Response::unrestricted(502, "Command not implemented").with_enhanced("5.5.1");
            return self.finish(response).await;
        }

        if self.session.is_authenticated() || self.session.phase() != SessionPhase::Helo {
            return self.finish(bad_sequence()).await;
        }

        if self.config.auth.require_tls && !self.session.is_secure() {
            let response = Response::unrestricted(
                538,
                "Encryption required for requested authentication mechanism",
            )
            .with_enhanced("5.7.11");
            return self.finish(response).await;
        }

        let mut words = command.argument().split_whitespace();
        let mechanism = words.next().unwrap_or_default().parse::<Mechanism>();
        let initial = words.next();

        let Ok(mechanism) = mechanism else {
            let response = Response::unrestricted(504, "Unrecognized authentication mechanism")
                .with_enhanced("5.5.4");
            return self.finish(response).await;
        };

        self.session.set_phase(SessionPhase::Auth);

        let exchange = match mechanism {
            Mechanism::Plain => self.auth_plain(initial).await?,
            Mechanism::Login => self.auth_login(initial).await?,
        };

        self.session.set_phase(SessionPhase::Helo);

        match exchange {
            AuthExchange::Eof => Ok(Step::Close),
            AuthExchange::Abort(response) => self.finish(response).await,
            AuthExchange::Credentials(username, password) => {
                let decided = self
                    .dispatcher
                    .on_auth(&mut self.session, &username, &password)
                    .await;

                let response = decided.unwrap_or_else(|| {
                    Reply::<response::Auth>::reject(None, None)
                        .enhanced("5.7.8")
                        .into_response()
                });

                if response.is_positive() {
                    self.session.set_authenticated();
                }

                self.finish(response).await
            }
        }
    }

    /// One 334 challenge/response round. The client may cancel with `*`.
    async fn auth_line(&mut self, challenge: &str) -> Result<Result<String, AuthExchange>, SessionError> {
        let wire = Response::unrestricted(334, challenge.to_string());
        self.reply(&wire).await?;

        let outcome = match timeout(
            self.idle_timeout(),
            self.connection.read_line(MAX_LINE_OCTETS),
        )
        .await
        {
            Ok(io) => io?,
            Err(_) => return self.timed_out().await.map(|()| Err(AuthExchange::Eof)),
        };

        match outcome {
            LineOutcome::Eof => Ok(Err(AuthExchange::Eof)),
            LineOutcome::TooLong => Ok(Err(AuthExchange::Abort(
                Response::unrestricted(500, "Line too long").with_enhanced("5.5.2"),
            ))),
            LineOutcome::Line(line) => {
                incoming!("{}", String::from_utf8_lossy(&line));
                match String::from_utf8(line) {
                    Ok(text) => Ok(Ok(text.trim().to_string())),
                    Err(_) => Ok(Err(AuthExchange::Abort(
                        Response::unrestricted(501, "Invalid base64 data").with_enhanced("5.5.2"),
                    ))),
                }
            }
        }
    }

    fn decode_b64(text: &str) -> Result<Vec<u8>, AuthExchange> {
        if text == "=" {
            return Ok(Vec::new());
        }

        BASE64.decode(text.as_bytes()).map_err(|_| {
            AuthExchange::Abort(
                Response::unrestricted(501, "Invalid base64 data").with_enhanced("5.5.2"),
            )
        })
    }

    fn cancelled(text: &str) -> Option<AuthExchange> {
        (text == "*").then(|| {
            AuthExchange::Abort(
                Response::unrestricted(501, "Authentication cancelled").with_enhanced("5.7.0"),
            )
        })
    }

    async fn auth_plain(&mut self, initial: Option<&str>) -> Result<AuthExchange, SessionError> {
        let text = match initial {
            Some(initial) => initial.to_string(),
            None => match self.auth_line("").await? {
                Ok(text) => text,
                Err(exchange) => return Ok(exchange),
            },
        };

        if let Some(abort) = Self::cancelled(&text) {
            return Ok(abort);
        }

        let decoded = match Self::decode_b64(&text) {
            Ok(decoded) => decoded,
            Err(abort) => return Ok(abort),
        };

        // RFC 4616: authzid NUL authcid NUL passwd
        let parts: Vec<&[u8]> = decoded.splitn(3, |&byte| byte == 0).collect();
        let (authcid, passwd) = match parts.as_slice() {
            [_, authcid, passwd] => (*authcid, *passwd),
            _ => {
                return Ok(AuthExchange::Abort(
                    Response::unrestricted(501, "Invalid PLAIN response").with_enhanced("5.5.2"),
                ))
            }
        };

        match (std::str::from_utf8(authcid), std::str::from_utf8(passwd)) {
            (Ok(username), Ok(password)) => Ok(AuthExchange::Credentials(
                username.to_string(),
                password.to_string(),
            )),
            _ => Ok(AuthExchange::Abort(
                Response::unrestricted(501, "Invalid PLAIN response").with_enhanced("5.5.2"),
            )),
        }
    }

    async fn auth_login(&mut self, initial: Option<&str>) -> Result<AuthExchange, SessionError> {
        // "VXNlcm5hbWU6" / "UGFzc3dvcmQ6" are base64 "Username:" / "Password:"
        let username_text = match initial {
            Some(initial) => initial.to_string(),
            None => match self.auth_line("VXNlcm5hbWU6").await? {
                Ok(text) => text,
                Err(exchange) => return Ok(exchange),
            },
        };

        if let Some(abort) = Self::cancelled(&username_text) {
            return Ok(abort);
        }

        let username = match Self::decode_b64(&username_text) {
            Ok(decoded) => decoded,
            Err(abort) => return Ok(abort),
        };

        let password_text = match self.auth_line("UGFzc3dvcmQ6").await? {
            Ok(text) => text,
            Err(exchange) => return Ok(exchange),
        };

        if let Some(abort) = Self::cancelled(&password_text) {
            return Ok(abort);
        }

        let password = match Self::decode_b64(&password_text) {
            Ok(decoded) => decoded,
            Err(abort) => return Ok(abort),
        };

        match (String::from_utf8(username), String::from_utf8(password)) {
            (Ok(username), Ok(password)) => Ok(AuthExchange::Credentials(username, password)),
            _ => Ok(AuthExchange::Abort(
                Response::unrestricted(501, "Invalid credentials encoding").with_enhanced("5.5.2"),
            )),
        }
    }

    async fn cmd_mail(&mut self, command: &SmtpCommand) -> Result<Step, SessionError> {
        if !matches!(
            self.session.phase(),
            SessionPhase::Helo | SessionPhase::Sender | SessionPhase::Recipient
        ) {
            return self.finish(bad_sequence()).await;
        }

        if self.config.auth.enable && !self.session.is_authenticated() {
            let response =
                Response::unrestricted(530, "Authentication required").with_enhanced("5.7.0");
            return self.finish(response).await;
        }

        let Some(ParsedArgs::MailFrom { sender, .. }) = command.parsed() else {
            let response =
                Response::unrestricted(501, "Bad address syntax").with_enhanced("5.5.4");
            return self.finish(response).await;
        };
        let sender = sender.clone();

        let limit = self.config.smtp.max_message_size;
        if limit > 0 {
            let declared = command
                .parsed()
                .and_then(|parsed| parsed.param("SIZE"))
                .and_then(|param| param.value.as_deref())
                .and_then(|value| value.parse::<usize>().ok());

            if declared.is_some_and(|declared| declared > limit) {
                let response = Response::unrestricted(552, "Message size exceeds fixed maximum")
                    .with_enhanced("5.3.4");
                return self.finish(response).await;
            }
        }

        // A second MAIL FROM without RSET starts a fresh transaction
        if self.session.sender().is_some() {
            self.session.reset_transaction();
            self.session.set_phase(SessionPhase::Helo);
        }

        let decided = self
            .dispatcher
            .on_mail_from(
                &mut self.session,
                (!sender.is_null()).then_some(&sender),
                command,
            )
            .await;

        let response =
            decided.unwrap_or_else(|| Reply::<response::MailFrom>::accept().into_response());

        if response.is_positive() {
            self.session.envelope_mut().set_sender(sender);
            self.session.set_phase(SessionPhase::Sender);
        }

        self.finish(response).await
    }

    async fn cmd_rcpt(&mut self, command: &SmtpCommand) -> Result<Step, SessionError> {
        if !matches!(
            self.session.phase(),
            SessionPhase::Sender | SessionPhase::Recipient
        ) {
            return self.finish(bad_sequence()).await;
        }

        let Some(ParsedArgs::RcptTo { recipient, .. }) = command.parsed() else {
            let response =
                Response::unrestricted(501, "Bad address syntax").with_enhanced("5.5.4");
            return self.finish(response).await;
        };
        let recipient = recipient.clone();

        let decided = self
            .dispatcher
            .on_rcpt_to(&mut self.session, &recipient, command)
            .await;

        let response =
            decided.unwrap_or_else(|| Reply::<response::RcptTo>::accept().into_response());

        if response.is_positive() {
            self.session.envelope_mut().push_recipient(recipient);
            self.session.set_phase(SessionPhase::Recipient);
        }

        self.finish(response).await
    }

    async fn cmd_data(&mut self) -> Result<Step, SessionError> {
        if self.session.phase() != SessionPhase::Recipient {
            return self.finish(bad_sequence()).await;
        }

        let decided = self.dispatcher.on_data_start(&mut self.session).await;
        let response =
            decided.unwrap_or_else(|| Reply::<response::DataStart>::accept().into_response());

        let positive = response.is_positive();
        if self.reply(&response).await? {
            return Ok(Step::Close);
        }
        if !positive {
            return Ok(Step::Continue);
        }

        self.session.set_data_mode(true);
        self.session.set_phase(SessionPhase::Data);

        let payload = self.read_payload().await?;

        self.session.set_data_mode(false);
        self.session.set_phase(SessionPhase::PostData);

        let step = match payload {
            Payload::Eof => Ok(Step::Close),
            Payload::Oversize => {
                let response = Response::unrestricted(552, "Message size exceeds fixed maximum")
                    .with_enhanced("5.3.4");
                self.finish(response).await
            }
            Payload::Complete(body) => {
                let mut stream = DataStream::new(body);
                let decided = self
                    .dispatcher
                    .on_data_end(&mut self.session, &mut stream)
                    .await;
                stream.close();

                let response = decided.unwrap_or_else(|| {
                    Reply::<response::DataEnd>::accept_with("Ok: message accepted").into_response()
                });
                self.finish(response).await
            }
        };

        self.session.reset_transaction();
        self.session.set_phase(SessionPhase::Helo);

        step
    }

    /// Consume octets until `CRLF . CRLF` at a line boundary, then unstuff.
    /// Anything the client pipelined behind the terminator is pushed back
    /// for the command loop. Memory stays bounded for oversize messages:
    /// past the limit only a terminator window is retained.
    async fn read_payload(&mut self) -> Result<Payload, SessionError> {
        let limit = self.config.smtp.max_message_size;
        let mut raw: Vec<u8> = Vec::new();
        let mut oversize = false;
        let mut trimmed = false;
        let mut scanned = 0_usize;

        let (body_len, resume_at) = loop {
            let read = match timeout(self.idle_timeout(), self.connection.read_data(&mut raw)).await
            {
                Ok(io) => io?,
                Err(_) => return self.timed_out().await.map(|()| Payload::Eof),
            };

            if read == 0 {
                return Ok(Payload::Eof);
            }

            // The accept of DATA is itself a line boundary
            if !trimmed && raw.starts_with(b".\r\n") {
                break (0, 3);
            }

            // Overlap by four octets in case the terminator spans chunks
            let from = scanned.saturating_sub(4);
            if let Some(pos) = raw[from..].windows(5).position(|window| window == b"\r\n.\r\n") {
                let at = from + pos;
                // The CRLF opening the terminator belongs to the message
                break (at + 2, at + 5);
            }
            scanned = raw.len();

            if limit > 0 && raw.len() > limit + OVERSIZE_SLACK {
                oversize = true;
                trimmed = true;
                let keep = raw.len() - 5;
                raw.drain(..keep);
                scanned = 0;
            }
        };

        let leftover = raw.split_off(resume_at.min(raw.len()));
        self.connection.unread(&leftover);

        if oversize {
            return Ok(Payload::Oversize);
        }

        raw.truncate(body_len);
        let body = unstuff(&raw);
        if limit > 0 && body.len() > limit {
            return Ok(Payload::Oversize);
        }

        Ok(Payload::Complete(body))
    }

    async fn cmd_rset(&mut self) -> Result<Step, SessionError> {
        let decided = self.dispatcher.on_rset(&mut self.session).await;
        let response = decided.unwrap_or_else(|| Reply::<response::Rset>::accept().into_response());

        if response.is_positive() {
            self.session.reset_transaction();
            if self.session.greeting().is_some() {
                self.session.set_phase(SessionPhase::Helo);
            }
        }

        self.finish(response).await
    }

    async fn cmd_noop(&mut self) -> Result<Step, SessionError> {
        let decided = self.dispatcher.on_noop(&mut self.session).await;
        let response = decided.unwrap_or_else(|| Reply::<response::Noop>::accept().into_response());
        self.finish(response).await
    }

    async fn cmd_help(&mut self) -> Result<Step, SessionError> {
        let decided = self.dispatcher.on_help(&mut self.session).await;
        let response = decided.unwrap_or_else(|| Reply::<response::Help>::accept().into_response());
        self.finish(response).await
    }

    async fn cmd_vrfy(&mut self, command: &SmtpCommand) -> Result<Step, SessionError> {
        let decided = self.dispatcher.on_vrfy(&mut self.session, command).await;
        let response = decided.unwrap_or_else(|| {
            Reply::<response::Vrfy>::accept().enhanced("2.0.0").into_response()
        });
        self.finish(response).await
    }

    async fn cmd_quit(&mut self) -> Result<Step, SessionError> {
        let decided = self.dispatcher.on_quit(&mut self.session).await;
        let response = decided.unwrap_or_else(|| {
            Reply::<response::Quit>::accept_with(format!(
                "{} closing transmission channel",
                self.hostname()
            ))
            .into_response()
        });

        self.reply(&response).await?;
        Ok(Step::Close)
    }

    async fn cmd_starttls(&mut self) -> Result<Step, SessionError> {
        if !self.config.tls.enable_starttls || self.tls.is_none() {
            let response =
                Response::unrestricted(502, "Command not implemented").with_enhanced("5.5.1");
            return self.finish(response).await;
        }

        if self.session.is_secure() || self.session.phase() != SessionPhase::Helo {
            return self.finish(bad_sequence()).await;
        }

        let response = Response::unrestricted(220, "Ready to start TLS").with_enhanced("2.0.0");
        if self.reply(&response).await? {
            return Ok(Step::Close);
        }

        Ok(Step::Upgrade)
    }

    /// Swap the transport under the session. Everything learned before the
    /// handshake is discarded; the client must greet again.
    async fn upgrade(&mut self) -> Result<(), SessionError> {
        let Some(settings) = self.tls.clone() else {
            return Err(SessionError::TlsHandshake("no TLS material loaded".to_string()));
        };

        let info = self.connection.upgrade(&settings).await?;
        self.session.reset_for_tls();

        internal!(
            level = DEBUG,
            "Connection upgraded: {} {}",
            info.proto(),
            info.cipher()
        );

        Ok(())
    }

    async fn cmd_unknown(&mut self, command: &SmtpCommand) -> Result<Step, SessionError> {
        let decided = self.dispatcher.on_unknown(&mut self.session, command).await;
        let response = decided.unwrap_or_else(|| {
            Reply::<response::Unknown>::reject(None, None)
                .enhanced("5.5.2")
                .into_response()
        });
        self.finish(response).await
    }
}
