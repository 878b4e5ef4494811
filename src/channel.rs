//! Low-level LDAP channel operations

use std::io;

use futures::{
    channel::mpsc::{self, Receiver, Sender},
    future,
    sink::SinkExt,
    StreamExt, TryStreamExt,
};
use log::{debug, error};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    codec::{Incoming, LdapCodec},
    message::{LdapMessage, ProtocolOp, ResultCode},
    oid,
    ops::ExtendedRequest,
    options::TlsOptions,
    socket::Transport,
};

const CHANNEL_SIZE: usize = 1024;
const STARTTLS_MESSAGE_ID: u32 = 1;

pub type LdapMessageSender = Sender<LdapMessage>;
pub type LdapMessageReceiver = Receiver<Incoming>;

fn io_error<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// LDAP channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    ConnectTimeout(#[from] tokio::time::error::Elapsed),
    #[cfg(feature = "tls-native-tls")]
    #[error(transparent)]
    Tls(#[from] native_tls::Error),
    #[error("STARTTLS failed")]
    StartTlsFailed,
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// LDAP TCP channel connector
pub struct LdapChannel {
    address: String,
    port: u16,
}

impl LdapChannel {
    /// Create a client-side channel with a given server address and port
    pub fn for_client<S>(address: S, port: u16) -> Self
    where
        S: AsRef<str>,
    {
        LdapChannel {
            address: address.as_ref().to_owned(),
            port,
        }
    }

    /// Connect to a server
    /// Returns a pair of (sender, receiver) endpoints
    pub(crate) async fn connect(
        self,
        transport: &Transport,
        tls_options: &TlsOptions,
    ) -> ChannelResult<(LdapMessageSender, LdapMessageReceiver)> {
        let stream = transport.factory.connect(&self.address, self.port).await?;

        if transport.start_tls {
            self.starttls_connect(tls_options, stream).await
        } else {
            self.make_channel(stream)
        }
    }

    #[cfg(feature = "tls-native-tls")]
    async fn starttls_connect<S>(
        &self,
        tls_options: &TlsOptions,
        mut stream: S,
    ) -> ChannelResult<(LdapMessageSender, LdapMessageReceiver)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!("Starting STARTTLS negotiation");
        let mut framed = tokio_util::codec::Framed::new(&mut stream, LdapCodec);
        let req = ExtendedRequest::new(oid::STARTTLS_OID, None);
        framed
            .send(LdapMessage::new(STARTTLS_MESSAGE_ID, ProtocolOp::ExtendedReq(req)))
            .await
            .map_err(|_| ChannelError::StartTlsFailed)?;
        if let Some(Ok(Ok(item))) = framed.next().await {
            match item.protocol_op {
                ProtocolOp::ExtendedResp(resp)
                    if resp.result.result_code == ResultCode::Success && item.message_id == STARTTLS_MESSAGE_ID =>
                {
                    debug!("STARTTLS succeeded");
                    drop(framed);
                    let stream = crate::socket::tls_connect(&self.address, tls_options, stream).await?;
                    return self.make_channel(stream);
                }
                _ => {}
            }
        }
        debug!("STARTTLS failed");
        Err(ChannelError::StartTlsFailed)
    }

    #[cfg(not(feature = "tls-native-tls"))]
    async fn starttls_connect<S>(
        &self,
        _tls_options: &TlsOptions,
        _stream: S,
    ) -> ChannelResult<(LdapMessageSender, LdapMessageReceiver)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Err(ChannelError::StartTlsFailed)
    }

    fn make_channel<S>(&self, stream: S) -> ChannelResult<(LdapMessageSender, LdapMessageReceiver)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // construct framed instance based on LdapCodec
        let framed = tokio_util::codec::Framed::new(stream, LdapCodec);

        // The 'in' channel:
        // Messages received from the socket will be forwarded to tx_in
        // and received by the connection via rx_in endpoint
        let (tx_in, rx_in) = mpsc::channel(CHANNEL_SIZE);

        // The 'out' channel:
        // Messages sent to tx_out by the connection will be picked up on rx_out endpoint
        // and forwarded to socket. Single consumer, so frames never interleave.
        let (tx_out, rx_out) = mpsc::channel(CHANNEL_SIZE);

        let address = format!("{}:{}", self.address, self.port);

        let channel = async move {
            // sink is the sending part, stream is the receiving part
            let (mut sink, stream) = framed.split();

            let mut rx = rx_out.map(Ok::<_, crate::error::Error>);

            // app -> socket
            let to_wire = sink.send_all(&mut rx);

            // convert incoming channel errors into io::Error
            let mut tx = tx_in.sink_map_err(io_error);

            // app <- socket
            let from_wire = stream
                .inspect_err(|e| error!("Receive error: {}", e))
                .map_err(io_error)
                .forward(&mut tx);

            // await for either of futures: terminating one side will drop the other
            let _ = future::select(to_wire, from_wire).await;
            debug!("Channel to {} closed", address);
        };

        // spawn in the background
        tokio::spawn(channel);

        // we return (tx_out, rx_in) pair so that the consumer can send and receive messages
        Ok((tx_out, rx_in))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::socket::PlainSocketFactory;

    fn new_msg() -> LdapMessage {
        LdapMessage::new(1, ProtocolOp::UnbindRequest)
    }

    fn plain() -> Transport {
        Transport {
            factory: Arc::new(PlainSocketFactory::new(Duration::from_secs(10))),
            start_tls: false,
        }
    }

    async fn start_server(num_msgs: usize) -> u16 {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = tcp.local_addr().unwrap().port();

        tokio::spawn(async move {
            if let Ok((stream, _)) = tcp.accept().await {
                let framed = Framed::new(stream, LdapCodec);
                let (mut sink, stream) = framed.split();
                let mut echo = stream.take(num_msgs).map(|m| m.map(|m| m.unwrap()));
                sink.send_all(&mut echo).await.unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn test_connection_success() {
        let port = start_server(2).await;

        let (mut sender, mut receiver) = LdapChannel::for_client("127.0.0.1", port)
            .connect(&plain(), &TlsOptions::default())
            .await
            .unwrap();
        let msg = new_msg();

        sender.send(msg.clone()).await.unwrap();
        sender.send(msg.clone()).await.unwrap();

        let mut count = 0;
        while let Some(m) = receiver.next().await {
            assert_eq!(Ok(msg.clone()), m);
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_connection_fail() {
        let port = {
            let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
            tcp.local_addr().unwrap().port()
        };
        let res = LdapChannel::for_client("127.0.0.1", port)
            .connect(&plain(), &TlsOptions::default())
            .await;

        assert!(res.is_err());
    }
}
