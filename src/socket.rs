//! Socket factories: the capability that opens the byte stream under a connection

use std::{fmt, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use log::debug;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

pub use crate::channel::{ChannelError, ChannelResult};

use crate::{
    error::Error,
    options::{LdapOptions, SecurityProtocol, TlsOptions},
};

/// Byte stream produced by a socket factory
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens connections to LDAP servers
pub trait SocketFactory: fmt::Debug + Send + Sync {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, ChannelResult<BoxedStream>>;

    /// True if streams from this factory are already protected by TLS
    fn is_secure(&self) -> bool {
        false
    }
}

async fn tcp_connect(host: &str, port: u16, timeout: Duration) -> ChannelResult<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port))).await??;
    debug!("Connection established to {}:{}", host, port);
    Ok(stream)
}

/// Plain TCP
#[derive(Debug, Clone)]
pub struct PlainSocketFactory {
    connect_timeout: Duration,
}

impl PlainSocketFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl SocketFactory for PlainSocketFactory {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, ChannelResult<BoxedStream>> {
        Box::pin(async move {
            let stream = tcp_connect(host, port, self.connect_timeout).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// TCP with an immediate TLS handshake
#[cfg(feature = "tls-native-tls")]
#[derive(Debug, Clone)]
pub struct TlsSocketFactory {
    connect_timeout: Duration,
    tls_options: TlsOptions,
}

#[cfg(feature = "tls-native-tls")]
impl TlsSocketFactory {
    pub fn new(connect_timeout: Duration, tls_options: TlsOptions) -> Self {
        Self {
            connect_timeout,
            tls_options,
        }
    }
}

#[cfg(feature = "tls-native-tls")]
impl SocketFactory for TlsSocketFactory {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, ChannelResult<BoxedStream>> {
        Box::pin(async move {
            let stream = tcp_connect(host, port, self.connect_timeout).await?;
            let stream = tls_connect(host, &self.tls_options, stream).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// TLS handshake over an established stream
#[cfg(feature = "tls-native-tls")]
pub(crate) async fn tls_connect<S>(
    host: &str,
    tls_options: &TlsOptions,
    stream: S,
) -> ChannelResult<tokio_native_tls::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!("Performing TLS handshake with {}", host);
    let mut tls_builder = native_tls::TlsConnector::builder();
    for cert in &tls_options.ca_certs {
        tls_builder.add_root_certificate(cert.clone());
    }
    tls_builder.danger_accept_invalid_hostnames(!tls_options.verify_hostname);
    tls_builder.danger_accept_invalid_certs(!tls_options.verify_certs);

    if let Some(ref identity) = tls_options.identity {
        tls_builder.identity(identity.clone());
    }

    let connector = tokio_native_tls::TlsConnector::from(tls_builder.build()?);
    let domain = tls_options.domain_name.as_deref().unwrap_or(host);

    let stream = connector.connect(domain, stream).await.map_err(ChannelError::Tls)?;

    debug!("Handshake completed with {}", host);

    Ok(stream)
}

/// Resolved transport of a connection
#[derive(Debug, Clone)]
pub(crate) struct Transport {
    pub factory: Arc<dyn SocketFactory>,
    /// Negotiate TLS with STARTTLS after connecting
    pub start_tls: bool,
}

fn tls_disabled() -> Error {
    Error::Config("TLS support is not enabled".to_owned())
}

fn tls_factory(options: &LdapOptions) -> Result<Arc<dyn SocketFactory>, Error> {
    #[cfg(feature = "tls-native-tls")]
    {
        Ok(Arc::new(TlsSocketFactory::new(options.connect_timeout, options.tls.clone())))
    }
    #[cfg(not(feature = "tls-native-tls"))]
    {
        let _ = options;
        Err(tls_disabled())
    }
}

/// Choose the socket factory: an explicit override wins, then the security protocol
/// setting, then the URL scheme.
pub(crate) fn select_transport(options: &LdapOptions, secure_url: bool) -> Result<Transport, Error> {
    if cfg!(not(feature = "tls-native-tls")) && options.security == Some(SecurityProtocol::StartTls) {
        return Err(tls_disabled());
    }

    if let Some(ref factory) = options.socket_factory {
        return match options.security {
            Some(SecurityProtocol::Tls) if !factory.is_secure() => Err(Error::Config(
                "socket factory override does not provide the requested TLS protocol".to_owned(),
            )),
            Some(SecurityProtocol::StartTls) if factory.is_secure() => Err(Error::Config(
                "STARTTLS requested on a socket factory that is already secure".to_owned(),
            )),
            Some(SecurityProtocol::Plain) if factory.is_secure() => Err(Error::Config(
                "plain transport requested with a secure socket factory override".to_owned(),
            )),
            security => Ok(Transport {
                factory: factory.clone(),
                start_tls: security == Some(SecurityProtocol::StartTls),
            }),
        };
    }

    let plain = || Arc::new(PlainSocketFactory::new(options.connect_timeout)) as Arc<dyn SocketFactory>;

    let transport = match options.security {
        Some(SecurityProtocol::Plain) => Transport {
            factory: plain(),
            start_tls: false,
        },
        Some(SecurityProtocol::Tls) => Transport {
            factory: tls_factory(options)?,
            start_tls: false,
        },
        Some(SecurityProtocol::StartTls) => Transport {
            factory: plain(),
            start_tls: true,
        },
        None if secure_url => Transport {
            factory: tls_factory(options)?,
            start_tls: false,
        },
        None => Transport {
            factory: plain(),
            start_tls: false,
        },
    };
    Ok(transport)
}
