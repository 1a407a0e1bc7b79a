/*!
 * @file server.rs
 * @brief MongoDB wire server: accept loop, TLS, per-connection sessions
 */

use crate::commands::{CommandProcessor, Session};
use crate::config::{Config, TlsConfig};
use crate::error::{MirageError, Result};
use crate::uri::format_connection_string;
use crate::wire_protocol::{self, OpCode, WireMessage};
use crate::{mirage_debug, mirage_error, mirage_info, mirage_warn};
use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub struct MirageServer {
    config: Config,
    processor: Arc<CommandProcessor>,
    shutdown: CancellationToken,
    active_connections: Arc<AtomicUsize>,
}

impl MirageServer {
    pub fn new(config: Config, processor: Arc<CommandProcessor>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            processor,
            shutdown,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Accept connections until the shutdown token fires. New connections
    /// are refused during shutdown; existing ones drain on their own.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr).await.map_err(MirageError::Network)?;

        let tls = if self.config.tls.enabled {
            Some(build_tls_acceptor(&self.config.tls)?)
        } else {
            None
        };

        mirage_info!(
            "MirageDB listening on {} ({})",
            addr,
            format_connection_string(
                &self.config.server.host,
                self.config.server.port,
                crate::uri::DEFAULT_DATABASE,
                self.config.tls.enabled,
            )
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    mirage_info!("Shutdown requested; refusing new connections");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let active = self.active_connections.load(Ordering::SeqCst);
                            if active >= self.config.server.max_connections as usize {
                                mirage_warn!("Connection limit reached; refusing {}", peer);
                                drop(stream);
                                continue;
                            }
                            self.spawn_connection(stream, peer.to_string(), tls.clone());
                        }
                        Err(e) => {
                            mirage_error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: String, tls: Option<TlsAcceptor>) {
        let processor = self.processor.clone();
        let shutdown = self.shutdown.clone();
        let counter = self.active_connections.clone();
        counter.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            mirage_debug!("Connection from {}", peer);
            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        handle_connection(tls_stream, peer.clone(), processor, shutdown).await
                    }
                    Err(e) => Err(MirageError::Connection(format!(
                        "TLS handshake with {} failed: {}",
                        peer, e
                    ))),
                },
                None => handle_connection(stream, peer.clone(), processor, shutdown).await,
            };
            if let Err(e) = result {
                mirage_warn!("Connection {} ended with error: {}", peer, e);
            } else {
                mirage_debug!("Connection {} closed", peer);
            }
            counter.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

async fn handle_connection<S>(
    mut stream: S,
    peer: String,
    processor: Arc<CommandProcessor>,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session {
        authenticated: None,
        client_addr: peer,
    };
    let response_ids = AtomicU32::new(1);

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = wire_protocol::read_message(&mut stream) => match read? {
                Some(message) => message,
                None => break,
            },
        };

        let response = dispatch(&message, &processor, &mut session, &shutdown).await;
        let response_id = response_ids.fetch_add(1, Ordering::SeqCst);

        let encoded = match response {
            Ok(body) => encode_for(&message, response_id, &body)?,
            Err(err) if err.is_fatal() => {
                mirage_error!("Fatal wire error: {}", err);
                break;
            }
            Err(err) => {
                let body = CommandProcessor::error_response(&err);
                encode_for(&message, response_id, &body)?
            }
        };

        stream.write_all(&encoded).await.map_err(MirageError::Network)?;
        stream.flush().await.map_err(MirageError::Network)?;
    }
    Ok(())
}

async fn dispatch(
    message: &WireMessage,
    processor: &CommandProcessor,
    session: &mut Session,
    shutdown: &CancellationToken,
) -> Result<bson::Document> {
    match OpCode::from_u32(message.header.op_code) {
        Some(OpCode::Msg) => {
            let command = wire_protocol::parse_op_msg(&message.payload)?;
            processor.handle(command, session, shutdown).await
        }
        Some(OpCode::Query) => {
            // Legacy handshake path: drivers probe with OP_QUERY against
            // <db>.$cmd before negotiating OP_MSG.
            let (namespace, mut command) = wire_protocol::parse_op_query(&message.payload)?;
            if let Some((db, _)) = namespace.split_once('.') {
                if !command.contains_key("$db") {
                    command.insert("$db", db.to_string());
                }
            }
            processor.handle(command, session, shutdown).await
        }
        Some(other) => Err(MirageError::WireProtocol(format!(
            "unsupported opcode: {:?}",
            other
        ))),
        None => Err(MirageError::WireProtocol(format!(
            "unknown opcode: {}",
            message.header.op_code
        ))),
    }
}

fn encode_for(request: &WireMessage, response_id: u32, body: &bson::Document) -> Result<Vec<u8>> {
    match OpCode::from_u32(request.header.op_code) {
        Some(OpCode::Query) => {
            wire_protocol::encode_op_reply(response_id, request.header.request_id, body)
        }
        _ => wire_protocol::encode_op_msg(response_id, request.header.request_id, body),
    }
}

/// Build a rustls acceptor from the TLS options.
pub fn build_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_path = config.cert.as_ref().ok_or_else(|| {
        MirageError::InvalidArgument("tls.cert is required when TLS is enabled".to_string())
    })?;
    let key_path = config.key.as_ref().ok_or_else(|| {
        MirageError::InvalidArgument("tls.key is required when TLS is enabled".to_string())
    })?;
    if config.passphrase.is_some() {
        return Err(MirageError::InvalidArgument(
            "encrypted private keys are not supported".to_string(),
        ));
    }

    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path).map_err(MirageError::Network)?,
    ))
    .map_err(MirageError::Network)?
    .into_iter()
    .map(rustls::Certificate)
    .collect();
    if certs.is_empty() {
        return Err(MirageError::InvalidArgument(format!(
            "no certificates found in {}",
            cert_path
        )));
    }

    let key = load_private_key(key_path)?;
    let versions = protocol_versions(&config.min_version, &config.max_version)?;

    let builder = rustls::ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&versions)
        .map_err(|e| MirageError::InvalidArgument(format!("invalid TLS versions: {}", e)))?;

    let server_config = if config.request_cert {
        let ca_path = config.ca.as_ref().ok_or_else(|| {
            MirageError::InvalidArgument("tls.ca is required with request_cert".to_string())
        })?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut BufReader::new(
            File::open(ca_path).map_err(MirageError::Network)?,
        ))
        .map_err(MirageError::Network)?
        {
            roots
                .add(&rustls::Certificate(cert))
                .map_err(|e| MirageError::InvalidArgument(format!("invalid CA cert: {}", e)))?;
        }
        let verifier = if config.reject_unauthorized {
            rustls::server::AllowAnyAuthenticatedClient::new(roots).boxed()
        } else {
            rustls::server::AllowAnyAnonymousOrAuthenticatedClient::new(roots).boxed()
        };
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    }
    .map_err(|e| MirageError::InvalidArgument(format!("invalid TLS key/cert: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_private_key(path: &str) -> Result<rustls::PrivateKey> {
    let mut reader = BufReader::new(File::open(path).map_err(MirageError::Network)?);
    for item in std::iter::from_fn(|| rustls_pemfile::read_one(&mut reader).transpose()) {
        match item.map_err(MirageError::Network)? {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(rustls::PrivateKey(key)),
            _ => continue,
        }
    }
    Err(MirageError::InvalidArgument(format!(
        "no private key found in {}",
        path
    )))
}

fn protocol_versions(
    min: &str,
    max: &str,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>> {
    let rank = |v: &str| match v {
        "1.2" => Ok(2),
        "1.3" => Ok(3),
        other => Err(MirageError::InvalidArgument(format!(
            "unsupported TLS version: {}",
            other
        ))),
    };
    let (lo, hi) = (rank(min)?, rank(max)?);
    let mut versions = Vec::new();
    if lo <= 3 && hi >= 3 {
        versions.push(&rustls::version::TLS13);
    }
    if lo <= 2 && hi >= 2 {
        versions.push(&rustls::version::TLS12);
    }
    if versions.is_empty() {
        return Err(MirageError::InvalidArgument(format!(
            "empty TLS version range: {}..{}",
            min, max
        )));
    }
    Ok(versions)
}
