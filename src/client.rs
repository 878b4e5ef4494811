//! LDAP client module

use std::{
    collections::VecDeque,
    convert::TryFrom,
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::{future::BoxFuture, Future, Stream, StreamExt, TryStreamExt};
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::{
    conn::{LdapConnection, MessageStream},
    controls::{self, PersistentSearchControl, SimplePagedResultsControl},
    error::Error,
    message::{Control, LdapMessage, LdapResult, ProtocolOp, ResultCode},
    model::{SearchEntry, SearchResult},
    notify::{NotificationListener, Subscriber, Subscription},
    oid,
    ops::{
        AddRequest, BindRequest, CompareRequest, DelRequest, ExtendedRequest, ExtendedResponse, ModifyDnRequest,
        ModifyRequest, Operation, PartialAttribute, SearchRequest,
    },
    options::{Credentials, LdapOptions, ReferralMode, TlsOptions},
    referral::{self, Referral},
    socket,
    url::{LdapUrl, DEFAULT_PORT},
};

pub type Result<T> = std::result::Result<T, Error>;

fn check_result(result: LdapResult) -> Result<()> {
    if result.result_code == ResultCode::Success {
        Ok(())
    } else {
        Err(Error::OperationFailed(result.into()))
    }
}

/// LDAP client builder
pub struct LdapClientBuilder {
    address: String,
    port: u16,
    options: LdapOptions,
}

impl LdapClientBuilder {
    /// Set port number, default is 389
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set TLS options, default is plain connection
    pub fn tls_options(mut self, options: TlsOptions) -> Self {
        self.options.tls = options;
        self
    }

    /// Replace the whole client environment
    pub fn options(mut self, options: LdapOptions) -> Self {
        self.options = options;
        self
    }

    /// Build client and connect
    pub async fn connect(self) -> Result<LdapClient> {
        let url = LdapUrl {
            secure: false,
            host: self.address,
            port: self.port,
            dn: String::new(),
            attributes: Vec::new(),
            scope: None,
            filter: None,
            extensions: Vec::new(),
        };
        LdapClient::connect_to(&url, self.options).await
    }
}

/// Credentials for the next bind on a shared connection
#[derive(Default)]
struct BindState {
    credentials: Option<Credentials>,
    pending: bool,
}

/// LDAP client
#[derive(Clone)]
pub struct LdapClient {
    connection: LdapConnection,
    options: LdapOptions,
    host: String,
    port: u16,
    bind_state: Arc<Mutex<BindState>>,
}

impl fmt::Debug for LdapClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("closed", &self.connection.is_closed())
            .finish()
    }
}

impl LdapClient {
    /// Create client builder
    pub fn builder<A: AsRef<str>>(address: A) -> LdapClientBuilder {
        LdapClientBuilder {
            address: address.as_ref().to_owned(),
            port: DEFAULT_PORT,
            options: LdapOptions::default(),
        }
    }

    /// Connect to the server named by an LDAP URL.
    /// If the environment carries credentials, a simple bind is performed right away.
    pub async fn connect_url<U: AsRef<str>>(url: U, options: LdapOptions) -> Result<Self> {
        Self::connect_to(&LdapUrl::parse(url.as_ref())?, options).await
    }

    pub(crate) async fn connect_to(url: &LdapUrl, options: LdapOptions) -> Result<Self> {
        let transport = socket::select_transport(&options, url.secure)?;
        let connection = LdapConnection::connect(&url.host, url.port, &transport, &options.tls).await?;
        debug!("Connected to {}:{}", url.host, url.port);

        let mut client = Self {
            connection,
            bind_state: Arc::new(Mutex::new(BindState {
                pending: options.credentials.is_some(),
                credentials: options.credentials.clone(),
            })),
            options,
            host: url.host.clone(),
            port: url.port,
        };
        client.ensure_bound().await?;
        Ok(client)
    }

    /// Client environment
    pub fn options(&self) -> &LdapOptions {
        &self.options
    }

    /// True once the connection has failed or been closed by the server
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Replace the bind credentials. The connection re-binds before the next operation.
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.options.credentials = Some(credentials.clone());
        let mut state = self.bind_state.lock();
        state.credentials = Some(credentials);
        state.pending = true;
    }

    async fn ensure_bound(&mut self) -> Result<()> {
        let credentials = {
            let state = self.bind_state.lock();
            if !state.pending {
                return Ok(());
            }
            state.credentials.clone()
        };

        if let Some(credentials) = credentials {
            debug!("Binding as {}", credentials.username);
            let req = BindRequest::simple(credentials.username, credentials.password);
            let controls = self.options.connect_controls.clone();
            self.do_bind(req, controls).await?;
        }
        self.bind_state.lock().pending = false;
        Ok(())
    }

    /// Controls attached to every request. In ignore mode ManageDsaIT makes the server
    /// return referral objects as plain entries.
    fn request_controls(&self) -> Vec<Control> {
        let mut controls = self.options.request_controls.clone();
        if self.options.referral == ReferralMode::Ignore
            && !controls.iter().any(|c| c.control_type == oid::MANAGE_DSA_IT_CONTROL_OID)
        {
            controls.push(controls::manage_dsa_it());
        }
        controls
    }

    /// Wait for the next response, racing the operation timeout if one is configured.
    /// On timeout the request is abandoned.
    async fn next_response(&mut self, stream: &mut MessageStream, timeout: Option<Duration>) -> Result<LdapMessage> {
        let next = match timeout {
            None => stream.next().await,
            Some(timeout) => match tokio::time::timeout(timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!("Request {} timed out, abandoning", stream.id());
                    self.connection.abandon(stream.id()).await?;
                    return Err(Error::Timeout);
                }
            },
        };
        next.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Send an operation and return its raw result, skipping intermediate responses
    async fn exchange<O: Operation>(&mut self, op: O, controls: Vec<Control>) -> Result<(LdapResult, O::Output)> {
        let mut stream = self.connection.send_recv_stream(op.into_protocol_op(), controls).await?;
        let timeout = self.options.operation_timeout;
        loop {
            let msg = self.next_response(&mut stream, timeout).await?;
            match msg.protocol_op {
                ProtocolOp::IntermediateResp(_) => continue,
                op => return O::parse_response(op).ok_or(Error::InvalidResponse),
            }
        }
    }

    /// Run an operation, interpreting the result code and applying the referral mode
    pub(crate) fn execute<O: Operation>(&mut self, op: O, hops: usize) -> BoxFuture<'_, Result<O::Output>> {
        Box::pin(async move {
            self.ensure_bound().await?;
            let controls = self.request_controls();
            let (result, output) = self.exchange(op.clone(), controls).await?;

            if result.is_referral() {
                let urls = result.referrals.clone().unwrap_or_default();
                match self.options.referral {
                    ReferralMode::Ignore => Err(Error::OperationFailed(result.into())),
                    ReferralMode::Throw => Err(Error::Referral(Box::new(Referral::new(
                        urls,
                        result,
                        self.options.clone(),
                    )))),
                    ReferralMode::Follow => referral::chase(op, urls, result, &self.options, hops).await,
                }
            } else if O::is_success(result.result_code) {
                Ok(output)
            } else {
                Err(Error::OperationFailed(result.into()))
            }
        })
    }

    async fn do_bind(&mut self, req: BindRequest, controls: Vec<Control>) -> Result<Option<Bytes>> {
        let (result, creds) = self.exchange(req, controls).await?;
        check_result(result)?;
        Ok(creds)
    }

    /// Perform simple bind operation with username and password
    pub async fn simple_bind<U, P>(&mut self, username: U, password: P) -> Result<()>
    where
        U: AsRef<str>,
        P: AsRef<str>,
    {
        let req = BindRequest::simple(username.as_ref(), password.as_ref());
        self.do_bind(req, self.options.connect_controls.clone()).await?;
        self.bind_state.lock().pending = false;
        Ok(())
    }

    /// Perform SASL EXTERNAL bind
    pub async fn sasl_external_bind(&mut self) -> Result<()> {
        let req = BindRequest::sasl("EXTERNAL", None);
        self.do_bind(req, self.options.connect_controls.clone()).await?;
        self.bind_state.lock().pending = false;
        Ok(())
    }

    /// Perform unbind operation. This will instruct LDAP server to terminate the connection
    pub async fn unbind(&mut self) -> Result<()> {
        self.connection.send(ProtocolOp::UnbindRequest, Vec::new()).await?;
        Ok(())
    }

    /// Abandon an outstanding request by message ID
    pub async fn abandon(&mut self, message_id: u32) -> Result<()> {
        self.connection.abandon(message_id).await
    }

    /// Send an extended request
    pub async fn extended(&mut self, request: ExtendedRequest) -> Result<ExtendedResponse> {
        self.execute(request, 0).await
    }

    /// Send 'whoami' extended request (RFC4532)
    pub async fn whoami(&mut self) -> Result<Option<String>> {
        let resp = self.extended(ExtendedRequest::new(oid::WHOAMI_OID, None)).await?;
        Ok(resp.response_value.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Perform add operation
    pub async fn add<S: AsRef<str>>(&mut self, dn: S, attributes: Vec<PartialAttribute>) -> Result<()> {
        self.execute(AddRequest::new(dn.as_ref(), attributes), 0).await
    }

    /// Perform delete operation
    pub async fn delete<S: AsRef<str>>(&mut self, dn: S) -> Result<()> {
        self.execute(DelRequest::new(dn.as_ref()), 0).await
    }

    /// Perform modify operation
    pub async fn modify(&mut self, request: ModifyRequest) -> Result<()> {
        self.execute(request, 0).await
    }

    /// Rename or move an entry
    pub async fn modify_dn(&mut self, request: ModifyDnRequest) -> Result<()> {
        self.execute(request, 0).await
    }

    /// Compare an attribute value. compareTrue and compareFalse are both successful outcomes.
    pub async fn compare<D, A, V>(&mut self, dn: D, attribute: A, value: V) -> Result<bool>
    where
        D: AsRef<str>,
        A: AsRef<str>,
        V: Into<Bytes>,
    {
        self.execute(CompareRequest::new(dn.as_ref(), attribute.as_ref(), value), 0)
            .await
    }

    /// Perform search operation and collect every entry and continuation reference.
    ///
    /// A failure after some entries have arrived is reported as [`Error::Search`]
    /// carrying the partial result.
    pub async fn search(&mut self, request: SearchRequest) -> Result<SearchResult> {
        self.search_with_hops(request, 0).await
    }

    /// Perform search operation and return the first entry
    pub async fn search_one(&mut self, request: SearchRequest) -> Result<Option<SearchEntry>> {
        let mut entries = self.search_stream(request).await?.try_collect::<VecDeque<_>>().await?;
        Ok(entries.pop_front())
    }

    pub(crate) fn search_with_hops(&mut self, request: SearchRequest, hops: usize) -> BoxFuture<'_, Result<SearchResult>> {
        Box::pin(async move {
            self.ensure_bound().await?;
            let controls = self.request_controls();
            let (mut result, ref_groups) = self.collect_search(request.clone(), controls).await?;

            let done = result.result.clone();
            match self.options.referral {
                ReferralMode::Ignore => {
                    if done.is_referral() || done.result_code == ResultCode::Success {
                        Ok(result)
                    } else {
                        Err(search_error(result, done.into()))
                    }
                }
                ReferralMode::Throw => {
                    if done.is_referral() {
                        let urls = done.referrals.clone().unwrap_or_default();
                        let referral = Referral::new(urls, done, self.options.clone());
                        Err(search_error(result, Error::Referral(Box::new(referral))))
                    } else if done.result_code != ResultCode::Success {
                        Err(search_error(result, done.into()))
                    } else if !result.references.is_empty() {
                        let urls = result.references.clone();
                        let referral = Referral::new(urls, done, self.options.clone());
                        Err(search_error(result, Error::Referral(Box::new(referral))))
                    } else {
                        Ok(result)
                    }
                }
                ReferralMode::Follow => {
                    if done.is_referral() {
                        let urls = done.referrals.clone().unwrap_or_default();
                        match referral::chase_search(request.clone(), urls, done, &self.options, hops).await {
                            Ok(other) => merge(&mut result, other, true),
                            Err(e) => return Err(search_error(result, e)),
                        }
                    } else if done.result_code != ResultCode::Success {
                        return Err(search_error(result, done.into()));
                    }

                    result.references.clear();
                    for urls in ref_groups {
                        let unresolved = LdapResult::new(ResultCode::Referral, "", "").with_referrals(urls.clone());
                        match referral::chase_search(request.clone(), urls, unresolved, &self.options, hops).await {
                            Ok(other) => merge(&mut result, other, false),
                            Err(e) => return Err(search_error(result, e)),
                        }
                    }
                    Ok(result)
                }
            }
        })
    }

    /// Gather search responses until the done PDU. Continuation references are returned
    /// grouped, one group of alternative URLs per reference.
    async fn collect_search(
        &mut self,
        request: SearchRequest,
        controls: Vec<Control>,
    ) -> Result<(SearchResult, Vec<Vec<String>>)> {
        let mut stream = self
            .connection
            .send_recv_stream(ProtocolOp::SearchRequest(request), controls)
            .await?;

        let timeout = self.options.operation_timeout;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        let mut result = SearchResult::empty();
        let mut ref_groups = Vec::new();

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(tokio::time::Instant::now()));
            let msg = match self.next_response(&mut stream, remaining).await {
                Ok(msg) => msg,
                Err(e) => return Err(search_error(result, e)),
            };
            match msg.protocol_op {
                ProtocolOp::SearchResEntry(raw) => {
                    result
                        .entries
                        .push(SearchEntry::from_raw(raw, msg.controls, &self.options.binary_attributes));
                }
                ProtocolOp::SearchResRef(urls) => {
                    result.references.extend(urls.iter().cloned());
                    ref_groups.push(urls);
                }
                ProtocolOp::SearchResDone(done) => {
                    result.result = done;
                    result.controls = msg.controls.unwrap_or_default();
                    return Ok((result, ref_groups));
                }
                ProtocolOp::IntermediateResp(_) => {}
                _ => return Err(search_error(result, Error::InvalidResponse)),
            }
        }
    }

    /// Perform search operation without paging. Returns a stream of search entries.
    /// Referrals are not chased; continuation references are skipped.
    pub async fn search_stream(&mut self, request: SearchRequest) -> Result<SearchEntries> {
        self.ensure_bound().await?;
        let controls = self.request_controls();
        let stream = self
            .connection
            .send_recv_stream(ProtocolOp::SearchRequest(request), controls)
            .await?;

        Ok(SearchEntries {
            inner: stream,
            binary: self.options.binary_attributes.clone(),
            page_control: None,
            page_finished: Arc::new(AtomicBool::new(false)),
            done: false,
        })
    }

    /// Perform search operation with paging. Returns a stream of pages
    pub fn search_paged(&mut self, request: SearchRequest, page_size: u32) -> Pages {
        Pages {
            page_control: Arc::new(RwLock::new(SimplePagedResultsControl::new(page_size))),
            page_finished: Arc::new(AtomicBool::new(true)),
            client: self.clone(),
            request,
            page_size,
            inner: None,
        }
    }

    /// Paged search using the configured batch size
    pub fn search_batched(&mut self, request: SearchRequest) -> Pages {
        let size = self.options.batch_size;
        self.search_paged(request, size)
    }

    /// Start a persistent search. Matching changes are delivered to `listener` until the
    /// subscription is cancelled or the connection goes away.
    pub async fn persistent_search(
        &mut self,
        request: SearchRequest,
        control: PersistentSearchControl,
        listener: Arc<dyn NotificationListener>,
    ) -> Result<Subscription> {
        self.ensure_bound().await?;
        let mut controls = self.request_controls();
        controls.push(control.into());
        let binary = self.options.binary_attributes.clone();

        let id = self
            .connection
            .add_listener(ProtocolOp::SearchRequest(request), controls, |id| {
                Subscriber::new(id, listener, binary)
            })
            .await?;
        debug!("Persistent search {} registered", id);

        Ok(Subscription::new(id, self.connection.clone()))
    }
}

fn search_error(partial: SearchResult, source: Error) -> Error {
    match source {
        Error::Search { .. } => source,
        source => Error::Search {
            partial: Box::new(partial),
            source: Box::new(source),
        },
    }
}

fn merge(result: &mut SearchResult, other: SearchResult, take_result: bool) {
    result.entries.extend(other.entries);
    result.references.extend(other.references);
    if take_result {
        result.result = other.result;
        result.controls = other.controls;
    }
}

/// Pages represents a stream of paged search results
pub struct Pages {
    page_control: Arc<RwLock<SimplePagedResultsControl>>,
    page_finished: Arc<AtomicBool>,
    client: LdapClient,
    request: SearchRequest,
    page_size: u32,
    inner: Option<BoxFuture<'static, Result<SearchEntries>>>,
}

impl Pages {
    fn is_page_finished(&self) -> bool {
        self.page_finished.load(Ordering::SeqCst)
    }
}

impl Stream for Pages {
    type Item = Result<SearchEntries>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.page_control.read().has_entries() {
            return Poll::Ready(None);
        }

        if self.inner.is_none() {
            if !self.is_page_finished() {
                return Poll::Ready(None);
            }

            let mut client = self.client.clone();
            let request = self.request.clone();
            let control_ref = self.page_control.clone();
            let page_size = self.page_size;
            let page_finished = self.page_finished.clone();

            self.page_finished.store(false, Ordering::SeqCst);

            let fut = async move {
                client.ensure_bound().await?;
                let mut controls = client.request_controls();
                let page = control_ref.read().clone().with_size(page_size);
                controls.push(page.into());

                let stream = client
                    .connection
                    .send_recv_stream(ProtocolOp::SearchRequest(request), controls)
                    .await?;
                Ok(SearchEntries {
                    inner: stream,
                    binary: client.options.binary_attributes.clone(),
                    page_control: Some(control_ref),
                    page_finished,
                    done: false,
                })
            };
            self.inner = Some(Box::pin(fut));
        }

        let polled = match self.inner.as_mut() {
            Some(inner) => inner.as_mut().poll(cx),
            None => return Poll::Ready(None),
        };

        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => {
                self.inner = None;
                self.page_control.write().clear_entries();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Ok(entries)) => {
                self.inner = None;
                Poll::Ready(Some(Ok(entries)))
            }
        }
    }
}

/// Search entries represents a stream of search results
pub struct SearchEntries {
    inner: MessageStream,
    binary: crate::model::BinaryAttributes,
    page_control: Option<Arc<RwLock<SimplePagedResultsControl>>>,
    page_finished: Arc<AtomicBool>,
    done: bool,
}

impl SearchEntries {
    fn search_done(&mut self, controls: Option<Vec<Control>>, done: LdapResult) -> Poll<Option<Result<SearchEntry>>> {
        self.page_finished.store(true, Ordering::SeqCst);
        self.done = true;

        if done.result_code == ResultCode::Success {
            if let Some(ref control_ref) = self.page_control {
                let page_control = controls.and_then(|controls| {
                    controls
                        .into_iter()
                        .find(|c| c.control_type == SimplePagedResultsControl::OID)
                        .and_then(|c| SimplePagedResultsControl::try_from(c).ok())
                });

                if let Some(page_control) = page_control {
                    *control_ref.write() = page_control;
                    Poll::Ready(None)
                } else {
                    control_ref.write().clear_entries();
                    Poll::Ready(Some(Err(Error::InvalidResponse)))
                }
            } else {
                Poll::Ready(None)
            }
        } else {
            if let Some(ref control_ref) = self.page_control {
                control_ref.write().clear_entries();
            }
            Poll::Ready(Some(Err(Error::OperationFailed(done.into()))))
        }
    }
}

impl Stream for SearchEntries {
    type Item = Result<SearchEntry>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            let rc = match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(None) => {
                    self.done = true;
                    Poll::Ready(Some(Err(Error::ConnectionClosed)))
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    Poll::Ready(Some(Err(e)))
                }
                Poll::Ready(Some(Ok(msg))) => match msg.protocol_op {
                    ProtocolOp::SearchResEntry(item) => {
                        Poll::Ready(Some(Ok(SearchEntry::from_raw(item, msg.controls, &self.binary))))
                    }
                    ProtocolOp::SearchResRef(_) | ProtocolOp::IntermediateResp(_) => continue,
                    ProtocolOp::SearchResDone(done) => self.search_done(msg.controls, done),
                    _ => {
                        self.done = true;
                        Poll::Ready(Some(Err(Error::InvalidResponse)))
                    }
                },
            };
            return rc;
        }
    }
}
