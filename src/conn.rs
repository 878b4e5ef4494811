use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, trace, warn};
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::{
    channel::{LdapChannel, LdapMessageReceiver, LdapMessageSender},
    error::Error,
    message::{Control, LdapMessage, ProtocolOp},
    notify::Subscriber,
    oid,
    options::TlsOptions,
    socket::Transport,
};

const MAX_MESSAGE_ID: u32 = i32::MAX as u32;

type Response = Result<LdapMessage, Error>;

/// Response slot of one request. Unbounded, so a slow consumer never holds up the reader.
struct Waiter {
    sender: mpsc::UnboundedSender<Response>,
    abandoned: Arc<AtomicBool>,
}

#[derive(Default)]
struct Shared {
    pending: RwLock<HashMap<u32, Waiter>>,
    listeners: RwLock<HashMap<u32, Arc<Subscriber>>>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl Shared {
    /// Next free message ID. Zero is reserved for unsolicited notifications.
    fn allocate_id(&self, pending: &HashMap<u32, Waiter>) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) & MAX_MESSAGE_ID;
            if id != 0 && !pending.contains_key(&id) && !self.listeners.read().contains_key(&id) {
                return id;
            }
        }
    }

    /// Fail every outstanding request and drop listener registrations
    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let waiters = self.pending.write().drain().collect::<Vec<_>>();
        for (id, waiter) in waiters {
            trace!("Failing pending request {}", id);
            let _ = waiter.sender.unbounded_send(Err(Error::ConnectionClosed));
        }

        let listeners = self.listeners.write().drain().collect::<Vec<_>>();
        for (_, subscriber) in listeners {
            subscriber.fail(&Error::ConnectionClosed);
        }
    }
}

struct ReaderGuard(JoinHandle<()>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One connection to one server, shared by every handle cloned from it.
/// The socket is closed when the last handle is dropped.
#[derive(Clone)]
pub(crate) struct LdapConnection {
    shared: Arc<Shared>,
    channel_sender: LdapMessageSender,
    _reader: Arc<ReaderGuard>,
}

impl LdapConnection {
    pub(crate) async fn connect<A>(
        address: A,
        port: u16,
        transport: &Transport,
        tls_options: &TlsOptions,
    ) -> Result<Self, Error>
    where
        A: AsRef<str>,
    {
        let (channel_sender, channel_receiver) = LdapChannel::for_client(address, port)
            .connect(transport, tls_options)
            .await?;

        let shared = Arc::new(Shared {
            next_id: AtomicU32::new(1),
            ..Default::default()
        });

        let reader = tokio::spawn(Self::read_loop(shared.clone(), channel_receiver));

        Ok(Self {
            shared,
            channel_sender,
            _reader: Arc::new(ReaderGuard(reader)),
        })
    }

    async fn read_loop(shared: Arc<Shared>, mut channel_receiver: LdapMessageReceiver) {
        while let Some(incoming) = channel_receiver.next().await {
            let (id, response) = match incoming {
                Ok(msg) => (msg.message_id, Ok(msg)),
                Err(malformed) => match malformed.message_id {
                    Some(id) => (id, Err(Error::Decode(malformed.error))),
                    None => {
                        warn!("Dropping undecodable message without message ID");
                        continue;
                    }
                },
            };

            if id == 0 {
                match response {
                    Ok(LdapMessage {
                        protocol_op: ProtocolOp::ExtendedResp(resp),
                        ..
                    }) if resp.response_name.as_deref() == Some(oid::NOTICE_OF_DISCONNECTION_OID) => {
                        debug!("Notice of disconnection received, exiting");
                        break;
                    }
                    _ => {
                        warn!("Dropping unsolicited message");
                        continue;
                    }
                }
            }

            let subscriber = shared.listeners.read().get(&id).cloned();
            if let Some(subscriber) = subscriber {
                if !subscriber.dispatch(response) {
                    shared.listeners.write().remove(&id);
                }
                continue;
            }

            match shared.pending.read().get(&id) {
                Some(waiter) => {
                    if waiter.sender.unbounded_send(response).is_err() {
                        trace!("Waiter for {} is gone", id);
                    }
                }
                None => warn!("Dropping message for unknown message ID {}", id),
            }
        }

        debug!("Connection reader finished");
        shared.shutdown();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn make_message(id: u32, op: ProtocolOp, controls: Vec<Control>) -> LdapMessage {
        LdapMessage::new(id, op).with_controls(controls)
    }

    /// Send a request whose responses are delivered as a stream.
    /// The waiter is registered before the request hits the wire.
    pub(crate) async fn send_recv_stream(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<MessageStream, Error> {
        self.check_open()?;

        let (tx, rx) = mpsc::unbounded();
        let abandoned = Arc::new(AtomicBool::new(false));
        let id = {
            let mut pending = self.shared.pending.write();
            let id = self.shared.allocate_id(&pending);
            pending.insert(
                id,
                Waiter {
                    sender: tx,
                    abandoned: abandoned.clone(),
                },
            );
            id
        };

        let stream = MessageStream {
            id,
            shared: self.shared.clone(),
            receiver: rx,
            abandoned,
            finished: false,
        };

        trace!("Sending request {}", id);
        self.channel_sender
            .send(Self::make_message(id, op, controls))
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        Ok(stream)
    }

    /// Send a request with a single response
    pub(crate) async fn send_recv(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<LdapMessage, Error> {
        self.send_recv_stream(op, controls)
            .await?
            .next()
            .await
            .unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Send a request without a response. Returns the message ID used.
    pub(crate) async fn send(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<u32, Error> {
        self.check_open()?;
        let id = self.shared.allocate_id(&self.shared.pending.read());
        self.channel_sender
            .send(Self::make_message(id, op, controls))
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(id)
    }

    /// Register a persistent-search listener and send its request
    pub(crate) async fn add_listener<F>(&mut self, op: ProtocolOp, controls: Vec<Control>, subscriber: F) -> Result<u32, Error>
    where
        F: FnOnce(u32) -> Subscriber,
    {
        self.check_open()?;
        let id = {
            let pending = self.shared.pending.read();
            let id = self.shared.allocate_id(&pending);
            self.shared.listeners.write().insert(id, Arc::new(subscriber(id)));
            id
        };

        if let Err(e) = self.channel_sender.send(Self::make_message(id, op, controls)).await {
            self.shared.listeners.write().remove(&id);
            debug!("Persistent search {} not sent: {}", id, e);
            return Err(Error::ConnectionClosed);
        }
        Ok(id)
    }

    pub(crate) fn has_listener(&self, id: u32) -> bool {
        self.shared.listeners.read().contains_key(&id)
    }

    pub(crate) fn remove_listener(&self, id: u32) -> bool {
        self.shared.listeners.write().remove(&id).is_some()
    }

    /// Abandon an outstanding request. The server sends nothing back,
    /// so the local waiter is failed with [`Error::Abandoned`].
    pub(crate) async fn abandon(&mut self, id: u32) -> Result<(), Error> {
        if let Some(waiter) = self.shared.pending.write().remove(&id) {
            waiter.abandoned.store(true, Ordering::SeqCst);
            let _ = waiter.sender.unbounded_send(Err(Error::Abandoned));
        }
        self.remove_listener(id);
        self.send(ProtocolOp::AbandonRequest(id), Vec::new()).await?;
        Ok(())
    }
}

/// Responses to one request, in arrival order
pub(crate) struct MessageStream {
    id: u32,
    shared: Arc<Shared>,
    receiver: mpsc::UnboundedReceiver<Response>,
    abandoned: Arc<AtomicBool>,
    finished: bool,
}

impl MessageStream {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

impl Stream for MessageStream {
    type Item = Response;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.receiver).poll_next(cx) {
            Poll::Ready(None) => {
                self.finished = true;
                if self.abandoned.load(Ordering::SeqCst) {
                    Poll::Ready(Some(Err(Error::Abandoned)))
                } else {
                    Poll::Ready(Some(Err(Error::ConnectionClosed)))
                }
            }
            other => other,
        }
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.shared.pending.write().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        message::{LdapResult, ResultCode},
        model::{BinaryAttributes, SearchRequest},
        notify::{ChangeNotification, NotificationListener},
        ops::{DelRequest, ExtendedResponse, SearchResultEntry},
        testing::MockServer,
    };

    fn delete(dn: &str) -> ProtocolOp {
        ProtocolOp::DelRequest(DelRequest::new(dn))
    }

    fn del_response(msg: &LdapMessage, text: &str) -> LdapMessage {
        LdapMessage::new(
            msg.message_id,
            ProtocolOp::DelResponse(LdapResult::new(ResultCode::Success, "", text)),
        )
    }

    #[tokio::test]
    async fn test_responses_matched_by_id() {
        // answers two requests in reverse order
        let server = MockServer::start(|mut session| async move {
            let first = session.recv().await.unwrap();
            let second = session.recv().await.unwrap();
            session.send(del_response(&second, "second")).await;
            session.send(del_response(&first, "first")).await;
            session.idle().await;
        })
        .await;

        let conn = server.connect().await;
        let (mut c1, mut c2) = (conn.clone(), conn.clone());
        let s1 = c1.send_recv_stream(delete("cn=1"), Vec::new()).await.unwrap();
        let s2 = c2.send_recv_stream(delete("cn=2"), Vec::new()).await.unwrap();
        assert_ne!(s1.id(), s2.id());

        let (r1, r2) = futures::join!(s1.into_future(), s2.into_future());
        let text = |r: Option<Response>| match r.unwrap().unwrap().protocol_op {
            ProtocolOp::DelResponse(result) => result.diagnostic_message,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(text(r1.0), "first");
        assert_eq!(text(r2.0), "second");
    }

    #[tokio::test]
    async fn test_notice_of_disconnection_fails_waiters() {
        let server = MockServer::start(|mut session| async move {
            session.recv().await.unwrap();
            let notice = ExtendedResponse {
                result: LdapResult::new(ResultCode::Unavailable, "", "shutting down"),
                response_name: Some(oid::NOTICE_OF_DISCONNECTION_OID.to_owned()),
                response_value: None,
            };
            session.send(LdapMessage::new(0, ProtocolOp::ExtendedResp(notice))).await;
            session.idle().await;
        })
        .await;

        let mut conn = server.connect().await;
        let res = conn.send_recv(delete("cn=1"), Vec::new()).await;
        assert!(matches!(res, Err(Error::ConnectionClosed)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send_recv(delete("cn=2"), Vec::new()).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_abandon_wakes_waiter() {
        let server = MockServer::start(|mut session| async move {
            session.recv().await.unwrap();
            let abandon = session.recv().await.unwrap();
            assert!(matches!(abandon.protocol_op, ProtocolOp::AbandonRequest(_)));
            session.idle().await;
        })
        .await;

        let conn = server.connect().await;
        let mut stream = conn.clone().send_recv_stream(delete("cn=1"), Vec::new()).await.unwrap();
        conn.clone().abandon(stream.id()).await.unwrap();
        assert!(matches!(stream.next().await, Some(Err(Error::Abandoned))));
    }

    #[tokio::test]
    async fn test_last_handle_closes_socket() {
        let (closed_tx, closed_rx) = futures::channel::oneshot::channel();
        let server = MockServer::start(move |mut session| async move {
            while session.recv().await.is_some() {}
            let _ = closed_tx.send(());
        })
        .await;

        let conn = server.connect().await;
        let other = conn.clone();
        drop(conn);
        assert!(!other.is_closed());
        drop(other);

        tokio::time::timeout(Duration::from_secs(5), closed_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_response_fails_only_its_request() {
        let server = MockServer::start(|mut session| async move {
            let first = session.recv().await.unwrap();
            let second = session.recv().await.unwrap();
            // unknown application tag inside a well-formed envelope
            session
                .send_raw(&[0x30, 0x05, 0x02, 0x01, first.message_id as u8, 0x5e, 0x00])
                .await;
            session.send(del_response(&second, "ok")).await;
            session.idle().await;
        })
        .await;

        let conn = server.connect().await;
        let s1 = conn.clone().send_recv_stream(delete("cn=1"), Vec::new()).await.unwrap();
        let s2 = conn.clone().send_recv_stream(delete("cn=2"), Vec::new()).await.unwrap();
        let (r1, r2) = futures::join!(s1.into_future(), s2.into_future());
        assert!(matches!(r1.0, Some(Err(Error::Decode(_)))));
        assert!(matches!(r2.0, Some(Ok(_))));
        assert!(!conn.is_closed());
    }

    #[derive(Default)]
    struct FailureLog(Mutex<Vec<String>>);

    impl NotificationListener for FailureLog {
        fn entry_changed(&self, _notification: ChangeNotification) {}

        fn notification_failed(&self, error: &Error) {
            self.0.lock().push(error.to_string());
        }
    }

    #[tokio::test]
    async fn test_disconnect_fails_listeners() {
        let server = MockServer::start(|mut session| async move {
            session.recv().await.unwrap();
            let notice = ExtendedResponse {
                result: LdapResult::new(ResultCode::Unavailable, "", ""),
                response_name: Some(oid::NOTICE_OF_DISCONNECTION_OID.to_owned()),
                response_value: None,
            };
            session.send(LdapMessage::new(0, ProtocolOp::ExtendedResp(notice))).await;
            session.idle().await;
        })
        .await;

        let log = Arc::new(FailureLog::default());
        let mut conn = server.connect().await;
        let id = conn
            .add_listener(ProtocolOp::SearchRequest(SearchRequest::root_dse()), Vec::new(), |id| {
                Subscriber::new(id, log.clone(), BinaryAttributes::default())
            })
            .await
            .unwrap();
        assert!(conn.has_listener(id));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !conn.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(!conn.has_listener(id));
        assert_eq!(log.0.lock().as_slice(), &["Connection closed".to_owned()]);
    }

    #[tokio::test]
    async fn test_unread_stream_does_not_block_others() {
        let server = MockServer::start(|mut session| async move {
            let search = session.recv().await.unwrap();
            let delete = session.recv().await.unwrap();
            for i in 0..500 {
                let entry = SearchResultEntry {
                    object_name: format!("cn={},o=apache", i),
                    attributes: Vec::new(),
                };
                session
                    .send(LdapMessage::new(search.message_id, ProtocolOp::SearchResEntry(entry)))
                    .await;
            }
            session.send(del_response(&delete, "ok")).await;
            session.idle().await;
        })
        .await;

        let conn = server.connect().await;
        let mut stream = conn
            .clone()
            .send_recv_stream(ProtocolOp::SearchRequest(SearchRequest::root_dse()), Vec::new())
            .await
            .unwrap();

        let mut other = conn.clone();
        let res = tokio::time::timeout(Duration::from_secs(5), other.send_recv(delete("cn=1"), Vec::new()))
            .await
            .unwrap();
        assert!(matches!(res, Ok(LdapMessage { protocol_op: ProtocolOp::DelResponse(_), .. })));

        for _ in 0..500 {
            assert!(matches!(stream.next().await, Some(Ok(_))));
        }
    }
}
