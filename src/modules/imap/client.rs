// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use crate::modules::error::GroundEffectResult;
use crate::modules::imap::oauth2::XOAuth2;
use crate::modules::imap::session::SessionStream;
use crate::raise_error;
use async_imap::Client as ImapClient;
use async_imap::Session as ImapSession;
use rustls::RootCertStore;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufWriter;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_io_timeout::TimeoutStream;
use tracing::debug;

pub const GMAIL_IMAP_HOST: &str = "imap.gmail.com";
pub const GMAIL_IMAP_PORT: u16 = 993;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const IO_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub(crate) struct Client {
    inner: ImapClient<Box<dyn SessionStream>>,
}

impl Deref for Client {
    type Target = ImapClient<Box<dyn SessionStream>>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Client {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Client {
    fn new(stream: Box<dyn SessionStream>) -> Self {
        Self {
            inner: ImapClient::new(stream),
        }
    }

    pub(crate) async fn authenticate(
        self,
        user: &str,
        access_token: &str,
    ) -> GroundEffectResult<ImapSession<Box<dyn SessionStream>>> {
        let Client { inner, .. } = self;
        let session = inner
            .authenticate(
                "XOAUTH2",
                XOAuth2::new(user.to_string(), access_token.to_string()),
            )
            .await
            .map_err(|(e, _)| {
                raise_error!(format!("{:#?}", e), ErrorCode::ImapAuthenticationFailed)
            })?;
        Ok(session)
    }

    /// Implicit-TLS connection to the Gmail IMAP endpoint.
    pub async fn connect() -> GroundEffectResult<Self> {
        let address = resolve_to_socket_addr(GMAIL_IMAP_HOST, GMAIL_IMAP_PORT)?;
        debug!("Attempting IMAP connection to {GMAIL_IMAP_HOST} ({address}).");

        let tcp_stream = establish_tcp_connection_with_timeout(address).await?;
        let tls_stream = establish_tls_stream(GMAIL_IMAP_HOST, tcp_stream).await?;
        let buffered_stream = BufWriter::new(tls_stream);
        let session_stream: Box<dyn SessionStream> = Box::new(buffered_stream);

        let mut client = Client::new(session_stream);
        let _greeting = client
            .read_response()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?
            .ok_or_else(|| {
                raise_error!(
                    "failed to read greeting".into(),
                    ErrorCode::ImapCommandFailed
                )
            })?;
        Ok(client)
    }
}

fn resolve_to_socket_addr(domain: &str, port: u16) -> GroundEffectResult<SocketAddr> {
    (domain, port)
        .to_socket_addrs()
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))?
        .next()
        .ok_or_else(|| {
            raise_error!(
                format!("no address resolved for {domain}:{port}"),
                ErrorCode::NetworkError
            )
        })
}

async fn establish_tcp_connection_with_timeout(
    address: SocketAddr,
) -> GroundEffectResult<Pin<Box<TimeoutStream<TcpStream>>>> {
    let tcp_stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| {
            raise_error!(
                format!("connect to {address} timed out"),
                ErrorCode::ConnectionTimeout
            )
        })?
        .map_err(|e| raise_error!(e.to_string(), ErrorCode::NetworkError))?;

    tcp_stream
        .set_nodelay(true)
        .map_err(|e| raise_error!(e.to_string(), ErrorCode::NetworkError))?;

    let mut timeout_stream = TimeoutStream::new(tcp_stream);
    timeout_stream.set_write_timeout(Some(IO_TIMEOUT));
    timeout_stream.set_read_timeout(Some(IO_TIMEOUT));
    Ok(Box::pin(timeout_stream))
}

async fn establish_tls_stream(
    server_hostname: &str,
    stream: impl SessionStream + 'static,
) -> GroundEffectResult<Box<dyn SessionStream>> {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.into(),
    };
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let tls_connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = rustls_pki_types::ServerName::try_from(server_hostname)
        .map_err(|_| raise_error!("Invalid DNS name".into(), ErrorCode::NetworkError))?
        .to_owned();

    let tls_stream = tls_connector
        .connect(server_name, stream)
        .await
        .map_err(|e| raise_error!(e.to_string(), ErrorCode::NetworkError))?;
    Ok(Box::new(tls_stream))
}
