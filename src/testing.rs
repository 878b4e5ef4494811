//! In-process LDAP server used by the connection and client tests

use std::{future::Future, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tokio_util::codec::Framed;

use crate::{
    client::LdapClient,
    codec::LdapCodec,
    conn::LdapConnection,
    message::LdapMessage,
    options::{LdapOptions, TlsOptions},
    socket::{PlainSocketFactory, Transport},
};

pub(crate) struct Session {
    framed: Framed<TcpStream, LdapCodec>,
}

impl Session {
    /// Next well-formed request, `None` when the client went away
    pub(crate) async fn recv(&mut self) -> Option<LdapMessage> {
        match self.framed.next().await {
            Some(Ok(Ok(msg))) => Some(msg),
            _ => None,
        }
    }

    pub(crate) async fn send(&mut self, msg: LdapMessage) {
        self.framed.send(msg).await.unwrap();
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        self.framed.flush().await.unwrap();
        self.framed.get_mut().write_all(bytes).await.unwrap();
    }

    /// Keep the socket open until the client closes it
    pub(crate) async fn idle(&mut self) {
        while self.recv().await.is_some() {}
    }
}

pub(crate) struct MockServer {
    port: u16,
}

impl MockServer {
    async fn listen() -> (TcpListener, u16) {
        let _ = pretty_env_logger::try_init_timed();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    /// Serve a single connection
    pub(crate) async fn start<F, Fut>(handler: F) -> Self
    where
        F: FnOnce(Session) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (listener, port) = Self::listen().await;
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                handler(Session {
                    framed: Framed::new(stream, LdapCodec),
                })
                .await;
            }
        });
        Self { port }
    }

    /// Serve every incoming connection with the same handler
    pub(crate) async fn start_many<F, Fut>(handler: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (listener, port) = Self::listen().await;
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    handler(Session {
                        framed: Framed::new(stream, LdapCodec),
                    })
                    .await;
                });
            }
        });
        Self { port }
    }

    pub(crate) fn url(&self) -> String {
        format!("ldap://127.0.0.1:{}", self.port)
    }

    pub(crate) async fn connect(&self) -> LdapConnection {
        let transport = Transport {
            factory: Arc::new(PlainSocketFactory::new(Duration::from_secs(5))),
            start_tls: false,
        };
        LdapConnection::connect("127.0.0.1", self.port, &transport, &TlsOptions::default())
            .await
            .unwrap()
    }

    pub(crate) async fn client(&self, options: LdapOptions) -> LdapClient {
        LdapClient::connect_url(self.url(), options).await.unwrap()
    }
}
