//! The transport under a session: a plain TCP stream, or TLS after a
//! STARTTLS upgrade. Owns the read-ahead buffer, so command lines and DATA
//! octets can interleave without losing bytes.

use std::{fs::File, io, io::BufReader, sync::Arc};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ProtocolVersion, ServerConfig, ServerConnection, SupportedCipherSuite,
    },
    server::TlsStream,
    TlsAcceptor,
};

use crate::{
    config::TlsConfig,
    error::{ServerError, SessionError},
};

const READ_CHUNK: usize = 4096;

/// TLS acceptor built once at server start, so missing material fails the
/// startup rather than the first STARTTLS.
#[derive(Clone)]
pub(crate) struct TlsSettings {
    acceptor: TlsAcceptor,
}

impl TlsSettings {
    pub(crate) fn load(config: &TlsConfig) -> Result<Self, ServerError> {
        if config.cert.as_os_str().is_empty() || config.key.as_os_str().is_empty() {
            return Err(ServerError::Tls(
                "enableStartTLS is set but [tls].cert / [tls].key are not".to_string(),
            ));
        }

        let certs = Self::load_certs(config)?;
        let key = Self::load_key(config)?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| ServerError::Tls(err.to_string()))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    fn load_certs(config: &TlsConfig) -> Result<Vec<CertificateDer<'static>>, ServerError> {
        let file = File::open(&config.cert)
            .map_err(|err| ServerError::Tls(format!("{}: {err}", config.cert.display())))?;

        rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| ServerError::Tls(format!("{}: {err}", config.cert.display())))
    }

    fn load_key(config: &TlsConfig) -> Result<PrivateKeyDer<'static>, ServerError> {
        let file = File::open(&config.key)
            .map_err(|err| ServerError::Tls(format!("{}: {err}", config.key.display())))?;
        let mut reader = BufReader::new(file);

        match rustls_pemfile::read_one(&mut reader)
            .map_err(|err| ServerError::Tls(format!("{}: {err}", config.key.display())))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(ServerError::Tls(format!(
                "{}: unable to determine key type",
                config.key.display()
            ))),
        }
    }
}

/// Negotiated TLS parameters, for the post-handshake debug line.
#[derive(Debug)]
pub(crate) struct TlsInfo {
    version: Option<ProtocolVersion>,
    cipher: Option<SupportedCipherSuite>,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> Self {
        Self {
            version: conn.protocol_version(),
            cipher: conn.negotiated_cipher_suite(),
        }
    }

    pub(crate) fn proto(&self) -> String {
        self.version
            .and_then(|version| version.as_str())
            .map(str::to_string)
            .unwrap_or_default()
    }

    pub(crate) fn cipher(&self) -> String {
        self.cipher
            .and_then(|cipher| cipher.suite().as_str())
            .map(str::to_string)
            .unwrap_or_default()
    }
}

/// Outcome of reading one logical line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineOutcome {
    /// CRLF stripped.
    Line(Vec<u8>),
    /// The line exceeded the limit; it has been drained off the wire.
    TooLong,
    /// Peer closed the connection.
    Eof,
}

enum Transport<Stream> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
    /// Mid-upgrade hole; observable only after a failed handshake, when the
    /// session is already tearing down.
    Detached,
}

fn detached_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport detached")
}

pub(crate) struct Connection<Stream> {
    transport: Transport<Stream>,
    buffer: Vec<u8>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub(crate) fn plain(stream: Stream) -> Self {
        Self {
            transport: Transport::Plain(stream),
            buffer: Vec::new(),
        }
    }

    /// Write one reply line, CRLF appended.
    pub(crate) async fn send_line(&mut self, line: &str) -> io::Result<()> {
        let wire = format!("{line}\r\n");

        match &mut self.transport {
            Transport::Plain(stream) => {
                stream.write_all(wire.as_bytes()).await?;
                stream.flush().await
            }
            Transport::Tls(stream) => {
                stream.write_all(wire.as_bytes()).await?;
                stream.flush().await
            }
            Transport::Detached => Err(detached_error()),
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0_u8; READ_CHUNK];

        let read = match &mut self.transport {
            Transport::Plain(stream) => stream.read(&mut chunk).await?,
            Transport::Tls(stream) => stream.read(&mut chunk).await?,
            Transport::Detached => return Err(detached_error()),
        };

        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Read one logical line of at most `limit` octets (line terminator
    /// included). An oversize line is consumed to its end so the
    /// conversation can continue.
    pub(crate) async fn read_line(&mut self, limit: usize) -> io::Result<LineOutcome> {
        let mut overflowed = false;

        loop {
            if let Some(pos) = self.buffer.iter().position(|&byte| byte == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();

                if overflowed || line.len() > limit {
                    return Ok(LineOutcome::TooLong);
                }

                if line.ends_with(b"\n") {
                    line.pop();
                }
                if line.ends_with(b"\r") {
                    line.pop();
                }

                return Ok(LineOutcome::Line(line));
            }

            if self.buffer.len() > limit {
                overflowed = true;
                self.buffer.clear();
            }

            if self.fill().await? == 0 {
                return Ok(LineOutcome::Eof);
            }
        }
    }

    /// Push octets back onto the front of the read-ahead buffer, e.g. a
    /// command the client pipelined behind the DATA terminator.
    pub(crate) fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        let mut restored = bytes.to_vec();
        restored.extend_from_slice(&self.buffer);
        self.buffer = restored;
    }

    /// Append raw DATA octets to `out`, draining any read-ahead first.
    /// Returns the number appended; 0 means the peer closed.
    pub(crate) async fn read_data(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        if !self.buffer.is_empty() {
            let read = self.buffer.len();
            out.extend_from_slice(&self.buffer);
            self.buffer.clear();
            return Ok(read);
        }

        let mut chunk = [0_u8; READ_CHUNK];
        let read = match &mut self.transport {
            Transport::Plain(stream) => stream.read(&mut chunk).await?,
            Transport::Tls(stream) => stream.read(&mut chunk).await?,
            Transport::Detached => return Err(detached_error()),
        };

        out.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Perform the STARTTLS handshake in place. Any read-ahead is dropped:
    /// RFC 3207 forbids pipelining a command past STARTTLS.
    pub(crate) async fn upgrade(&mut self, settings: &TlsSettings) -> Result<TlsInfo, SessionError> {
        self.buffer.clear();

        match std::mem::replace(&mut self.transport, Transport::Detached) {
            Transport::Plain(stream) => {
                let stream = settings
                    .acceptor
                    .accept(stream)
                    .await
                    .map_err(|err| SessionError::TlsHandshake(err.to_string()))?;
                let info = TlsInfo::of(stream.get_ref().1);

                self.transport = Transport::Tls(Box::new(stream));
                Ok(info)
            }
            transport => {
                self.transport = transport;
                Err(SessionError::TlsHandshake(
                    "connection is already TLS".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use tokio::io::AsyncWriteExt;

    use super::{Connection, LineOutcome};

    #[tokio::test]
    async fn reads_lines_across_chunks() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut connection = Connection::plain(server);

        client.write_all(b"EHLO clie").await.unwrap();
        client.write_all(b"nt.example\r\nNO").await.unwrap();
        client.write_all(b"OP\r\n").await.unwrap();

        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineOutcome::Line(b"EHLO client.example".to_vec())
        );
        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineOutcome::Line(b"NOOP".to_vec())
        );

        drop(client);
        assert_eq!(connection.read_line(512).await.unwrap(), LineOutcome::Eof);
    }

    #[tokio::test]
    async fn oversize_line_is_drained() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::plain(server);

        let long = format!("NOOP {}\r\nRSET\r\n", "x".repeat(600));
        client.write_all(long.as_bytes()).await.unwrap();

        assert_eq!(connection.read_line(512).await.unwrap(), LineOutcome::TooLong);
        // The next command is intact
        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineOutcome::Line(b"RSET".to_vec())
        );
    }

    #[tokio::test]
    async fn data_read_drains_read_ahead() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::plain(server);

        // DATA\r\n and the start of the body arrive in one packet
        client.write_all(b"DATA\r\nbody line\r\n").await.unwrap();

        assert_eq!(
            connection.read_line(512).await.unwrap(),
            LineOutcome::Line(b"DATA".to_vec())
        );

        let mut payload = Vec::new();
        let read = connection.read_data(&mut payload).await.unwrap();
        assert_eq!(read, 11);
        assert_eq!(payload, b"body line\r\n");
    }

    #[tokio::test]
    async fn sends_crlf_terminated_lines() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::plain(server);

        connection.send_line("220 mx.example.com ESMTP").await.unwrap();

        let mut reader = Connection::plain(client);
        assert_eq!(
            reader.read_line(512).await.unwrap(),
            LineOutcome::Line(b"220 mx.example.com ESMTP".to_vec())
        );
    }
}
