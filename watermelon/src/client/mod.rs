use std::{fmt::Write, num::NonZeroU64, process::abort, sync::Arc, time::Duration};
#[cfg(test)]
use std::{
    net::{IpAddr, Ipv4Addr},
    num::{NonZeroU16, NonZeroU32},
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use rand::RngCore;
use tokio::sync::{
    mpsc::{self, error::TrySendError, Permit},
    oneshot,
};
use tracing::{debug, warn};
#[cfg(test)]
use watermelon_proto::NonStandardServerInfo;
use watermelon_proto::{
    error::ServerError, headers::HeaderMap, QueueGroup, ServerAddr, ServerInfo, ServerMessage,
    Subject, SubscriptionId,
};

pub use self::builder::{Callbacks, ClientBuilder, Echo};
pub use self::commands::{
    ClientPublish, ClientRequest, DoClientPublish, DoClientRequest, DoOwnedClientPublish,
    DoOwnedClientRequest, OwnedClientPublish, OwnedClientRequest, Publish, PublishBuilder,
    PublishError, Request, RequestBuilder, RequestError, ResponseError, ResponseFut,
};
pub use self::quick_info::QuickInfo;
pub(crate) use self::quick_info::RawQuickInfo;
#[cfg(test)]
use self::tests::TestHandler;
use crate::{
    atomic::{AtomicU64, Ordering},
    connection_status::{ConnectionStatus, RawConnectionStatus},
    core::{MultiplexedSubscription, Subscription},
    error::{with_last_error_scope, Error},
    handler::{
        Handler, HandlerCommand, HandlerOutput, RecycledHandler, MULTIPLEXED_SUBSCRIPTION_ID,
    },
    runtime::{CallbackEvent, Runtime, SubscriptionHandler},
    server_pool::ServerPool,
    statistics::{Statistics, StatisticsSnapshot},
};

mod builder;
mod commands;
mod quick_info;
mod reconnect_buffer;
#[cfg(test)]
pub(crate) mod tests;

use self::reconnect_buffer::ReconnectBuffer;

#[cfg(feature = "from-env")]
pub(super) mod from_env;

const CLIENT_OP_CHANNEL_SIZE: usize = 512;
const SUBSCRIPTION_CHANNEL_SIZE: usize = 256;

/// A NATS client
///
/// `Client` is a `Clone`able handle to a NATS connection.
/// If the connection is lost, the client will automatically reconnect and
/// resume any currently open subscriptions.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    sender: mpsc::Sender<HandlerCommand>,
    info: Arc<ArcSwap<ServerInfo>>,
    quick_info: Arc<RawQuickInfo>,
    multiplexed_subscription_prefix: Subject,
    next_subscription_id: AtomicU64,
    inbox_prefix: Subject,
    default_response_timeout: Duration,
    status: Arc<RawConnectionStatus>,
    statistics: Arc<Statistics>,
    runtime: Arc<Runtime>,
    max_pending_messages_per_subscription: u64,
    max_pending_bytes_per_subscription: u64,
    reconnect_buffer: Arc<ReconnectBuffer>,
    handler: tokio::task::JoinHandle<()>,
}

/// An error encountered while trying to publish a command to a closed [`Client`]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[error("client closed")]
pub struct ClientClosedError;

#[derive(Debug, thiserror::Error)]
#[error("try command error")]
pub enum TryCommandError {
    /// The client's internal buffer is currently full
    #[error("buffer full")]
    BufferFull,
    /// The reconnect-time publish buffer is full
    #[error("insufficient buffer")]
    InsufficientBuffer,
    /// The client has been closed via [`Client::close`]
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

/// A subscription delivered through the shared worker pool
/// (`DeliveryModel::SharedPool`).
///
/// Unlike [`Subscription`], messages aren't polled by the holder: they're
/// pushed to the handler closure given to
/// [`Client::subscribe_with_handler`]. This handle only controls the
/// subscription's lifetime.
#[derive(Debug)]
pub struct SharedSubscription {
    id: SubscriptionId,
    client: Client,
}

impl SharedSubscription {
    /// Ask the NATS server to stop this subscription.
    ///
    /// # Errors
    ///
    /// This returns an error if the connection with the client is closed.
    pub async fn close(&self) -> Result<(), ClientClosedError> {
        self.client.unsubscribe(self.id, None).await
    }
}

impl Client {
    /// Construct a new client
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(super) async fn connect(mut builder: ClientBuilder) -> Result<Self, Error> {
        if builder.servers.is_empty() {
            return Err(Error::new(crate::error::ErrorKind::AddressMissing)
                .bubble("Client::connect"));
        }

        let callbacks = Arc::new(std::mem::take(&mut builder.callbacks));
        let pool_size = match builder.delivery_model {
            crate::runtime::DeliveryModel::SharedPool { size } => size,
            crate::runtime::DeliveryModel::PerSubscription => 1,
        };
        let runtime = Runtime::open(callbacks, pool_size);
        let statistics = Arc::new(Statistics::default());
        let server_pool = Arc::new(std::sync::Mutex::new(ServerPool::new(
            builder.servers.clone(),
            builder.randomize_servers,
        )));

        let (sender, receiver) = mpsc::channel(CLIENT_OP_CHANNEL_SIZE);

        let quick_info = Arc::new(RawQuickInfo::new());
        let recycle = RecycledHandler::new(receiver, Arc::clone(&quick_info), &builder);

        let Some((handle, connected_addr)) =
            connect_from_pool(&server_pool, &builder, recycle, &runtime, &statistics).await
        else {
            return Err(Error::new(crate::error::ErrorKind::NoServer).bubble("Client::connect"));
        };
        debug!(%connected_addr, "connected");

        let info = handle.info().clone();
        let multiplexed_subscription_prefix = handle.multiplexed_subscription_prefix().clone();
        let inbox_prefix = builder.inbox_prefix.clone();
        let default_response_timeout = builder.default_response_timeout;
        let max_pending_messages_per_subscription = builder.max_pending_messages_per_subscription;
        let max_pending_bytes_per_subscription = builder.max_pending_bytes_per_subscription;
        let reconnect_buffer = Arc::new(ReconnectBuffer::new(builder.max_reconnect_pending_bytes));
        let status = Arc::new(RawConnectionStatus::new(ConnectionStatus::Connected));
        runtime.callbacks.post(CallbackEvent::Connected);

        let handler = tokio::spawn(with_last_error_scope(run_connection_loop(
            handle,
            builder,
            Arc::clone(&server_pool),
            Arc::clone(&runtime),
            Arc::clone(&statistics),
            Arc::clone(&status),
            Arc::clone(&reconnect_buffer),
        )));

        Ok(Self {
            inner: Arc::new(ClientInner {
                info,
                sender,
                quick_info,
                multiplexed_subscription_prefix,
                next_subscription_id: AtomicU64::new(u64::from(MULTIPLEXED_SUBSCRIPTION_ID) + 1),
                inbox_prefix,
                default_response_timeout,
                status,
                statistics,
                runtime,
                max_pending_messages_per_subscription,
                max_pending_bytes_per_subscription,
                reconnect_buffer,
                handler,
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn test(client_to_handler_chan_size: usize) -> (Self, TestHandler) {
        let builder = Self::builder();
        let (sender, receiver) = mpsc::channel(client_to_handler_chan_size);
        let info = Arc::new(ArcSwap::new(Arc::from(ServerInfo {
            id: "1234".to_owned(),
            name: "watermelon-test".to_owned(),
            version: "2.10.17".to_owned(),
            go_version: "1.22.5".to_owned(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: NonZeroU16::new(4222).unwrap(),
            supports_headers: true,
            max_payload: NonZeroU32::new(1024 * 1024).unwrap(),
            protocol_version: 2,
            client_id: Some(1),
            auth_required: false,
            tls_required: false,
            tls_verify: false,
            tls_available: false,
            connect_urls: Vec::new(),
            websocket_connect_urls: Vec::new(),
            lame_duck_mode: false,
            git_commit: None,
            supports_jetstream: true,
            ip: None,
            client_ip: None,
            nonce: None,
            cluster_name: None,
            domain: None,

            non_standard: NonStandardServerInfo::default(),
        })));
        let quick_info = Arc::new(RawQuickInfo::new());
        let multiplexed_subscription_prefix = create_inbox_subject(&builder.inbox_prefix);
        let runtime = Runtime::open(Arc::new(Callbacks::default()), 1);
        let statistics = Arc::new(Statistics::default());
        let status = Arc::new(RawConnectionStatus::new(ConnectionStatus::Connected));

        let this = Self {
            inner: Arc::new(ClientInner {
                sender,
                info: Arc::clone(&info),
                quick_info: Arc::clone(&quick_info),
                multiplexed_subscription_prefix,
                next_subscription_id: AtomicU64::new(1),
                inbox_prefix: builder.inbox_prefix,
                default_response_timeout: builder.default_response_timeout,
                status,
                statistics,
                runtime,
                max_pending_messages_per_subscription: builder
                    .max_pending_messages_per_subscription,
                max_pending_bytes_per_subscription: builder.max_pending_bytes_per_subscription,
                reconnect_buffer: Arc::new(ReconnectBuffer::new(
                    builder.max_reconnect_pending_bytes,
                )),
                handler: tokio::spawn(async move {}),
            }),
        };
        let handler = TestHandler {
            receiver,
            _info: info,
            quick_info,
        };
        (this, handler)
    }

    /// Publish a new message to the NATS server
    ///
    /// Consider calling [`Publish::client`] instead if you already have
    /// a [`Publish`] instance.
    #[must_use]
    pub fn publish(&self, subject: Subject) -> ClientPublish {
        ClientPublish::build(self, subject)
    }

    /// Publish a new message to the NATS server
    ///
    /// Consider calling [`Request::client`] instead if you already have
    /// a [`Request`] instance.
    #[must_use]
    pub fn request(&self, subject: Subject) -> ClientRequest {
        ClientRequest::build(self, subject)
    }

    /// Publish a new message to the NATS server, taking ownership of this client
    ///
    /// When possible consider using [`Client::publish`] instead.
    ///
    /// Consider calling [`Publish::client_owned`] instead if you already have
    /// a [`Publish`] instance.
    #[must_use]
    pub fn publish_owned(self, subject: Subject) -> OwnedClientPublish {
        OwnedClientPublish::build(self, subject)
    }

    /// Publish a new message to the NATS server, taking ownership of this client
    ///
    /// When possible consider using [`Client::request`] instead.
    ///
    /// Consider calling [`Request::client_owned`] instead if you already have
    /// a [`Request`] instance.
    #[must_use]
    pub fn request_owned(self, subject: Subject) -> OwnedClientRequest {
        OwnedClientRequest::build(self, subject)
    }

    /// Subscribe to the given filter subject
    ///
    /// Create a new subscription with the NATS server and ask for all
    /// messages matching the given `filter_subject` to be delivered
    /// to the client.
    ///
    /// If `queue_group` is provided and multiple clients subscribe with
    /// the same [`QueueGroup`] value, the NATS server will try to deliver
    /// these messages to only one of the clients.
    ///
    /// If the client was built with [`Echo::Allow`], then messages
    /// published by this same client may be received by this subscription.
    ///
    /// # Errors
    ///
    /// This returns an error if the connection with the client is closed.
    pub async fn subscribe(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Subscription, ClientClosedError> {
        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| ClientClosedError)?;

        Ok(self.do_subscribe(permit, filter_subject, queue_group))
    }

    pub(crate) fn try_subscribe(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Subscription, TryCommandError> {
        let permit = self
            .inner
            .sender
            .try_reserve()
            .map_err(|_| TryCommandError::BufferFull)?;

        Ok(self.do_subscribe(permit, filter_subject, queue_group))
    }

    fn do_subscribe(
        &self,
        permit: Permit<'_, HandlerCommand>,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Subscription {
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::AcqRel)
            .into();
        if id == SubscriptionId::MAX {
            abort();
        }
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CHANNEL_SIZE);
        let pending_bytes = Arc::new(AtomicU64::new(0));
        let pending_msgs = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let max_pending_bytes = if self.inner.max_pending_bytes_per_subscription == 0 {
            u64::MAX
        } else {
            self.inner.max_pending_bytes_per_subscription
        };
        let max_pending_msgs = if self.inner.max_pending_messages_per_subscription == 0 {
            u64::MAX
        } else {
            self.inner.max_pending_messages_per_subscription
        };

        permit.send(HandlerCommand::Subscribe {
            id,
            subject: filter_subject,
            queue_group,
            messages: sender,
            pending_bytes: Arc::clone(&pending_bytes),
            max_pending_bytes,
            pending_msgs: Arc::clone(&pending_msgs),
            max_pending_msgs,
            dropped: Arc::clone(&dropped),
        });
        Subscription::new(id, self.clone(), receiver, pending_bytes, pending_msgs, dropped)
    }

    /// Subscribe to `filter_subject`, delivering messages to `handler` on
    /// one of the connection's shared delivery workers instead of a private
    /// channel (`DeliveryModel::SharedPool`).
    ///
    /// `handler` is invoked serially on its assigned worker; it must not
    /// block, as doing so delays every other subscription sharing that
    /// worker.
    ///
    /// # Errors
    ///
    /// This returns an error if the connection with the client is closed.
    pub async fn subscribe_with_handler<F>(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
        handler: F,
    ) -> Result<SharedSubscription, ClientClosedError>
    where
        F: FnMut(Result<ServerMessage, ServerError>) + Send + 'static,
    {
        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| ClientClosedError)?;

        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::AcqRel)
            .into();
        if id == SubscriptionId::MAX {
            abort();
        }

        let pending_bytes = Arc::new(AtomicU64::new(0));
        let pending_msgs = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let max_pending_bytes = if self.inner.max_pending_bytes_per_subscription == 0 {
            u64::MAX
        } else {
            self.inner.max_pending_bytes_per_subscription
        };
        let max_pending_msgs = if self.inner.max_pending_messages_per_subscription == 0 {
            u64::MAX
        } else {
            self.inner.max_pending_messages_per_subscription
        };

        let worker = self.inner.runtime.workers.lock().unwrap_or_else(|e| e.into_inner()).assign(
            id,
            Box::new(handler) as SubscriptionHandler,
            Arc::clone(&pending_bytes),
            Arc::clone(&pending_msgs),
        );

        permit.send(HandlerCommand::SubscribeShared {
            id,
            subject: filter_subject,
            queue_group,
            worker,
            pending_bytes,
            max_pending_bytes,
            pending_msgs,
            max_pending_msgs,
            dropped,
        });

        Ok(SharedSubscription {
            id,
            client: self.clone(),
        })
    }

    pub(super) async fn multiplexed_request(
        &self,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<MultiplexedSubscription, ClientClosedError> {
        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| ClientClosedError)?;

        Ok(self.do_multiplexed_request(permit, subject, headers, payload))
    }

    pub(super) fn try_multiplexed_request(
        &self,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<MultiplexedSubscription, TryCommandError> {
        let permit = self
            .inner
            .sender
            .try_reserve()
            .map_err(|_| TryCommandError::BufferFull)?;

        Ok(self.do_multiplexed_request(permit, subject, headers, payload))
    }

    fn do_multiplexed_request(
        &self,
        permit: Permit<'_, HandlerCommand>,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> MultiplexedSubscription {
        let (sender, receiver) = oneshot::channel();

        let reply_subject = create_inbox_subject(&self.inner.multiplexed_subscription_prefix);

        permit.send(HandlerCommand::RequestMultiplexed {
            subject,
            reply_subject: reply_subject.clone(),
            headers,
            payload,
            reply: sender,
        });
        MultiplexedSubscription::new(reply_subject, receiver, self.clone())
    }

    /// Get the last [`ServerInfo`] sent by the server
    ///
    /// Consider calling [`Client::quick_info`] if you only need
    /// information about Lame Duck Mode.
    #[must_use]
    pub fn server_info(&self) -> Arc<ServerInfo> {
        self.inner.info.load_full()
    }

    /// Get information about the client
    #[must_use]
    pub fn quick_info(&self) -> QuickInfo {
        self.inner.quick_info.get()
    }

    /// The connection state machine's current state.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.get()
    }

    /// A snapshot of this connection's traffic counters.
    #[must_use]
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.statistics.snapshot()
    }

    /// Round-trip a `PING`/`PONG` with the server, returning once the
    /// server has acknowledged every command enqueued before this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] with [`ErrorKind::ConnectionClosed`](crate::core::error::ErrorKind::ConnectionClosed)
    /// if the client is closed or the connection is lost before the
    /// round-trip completes, or [`ErrorKind::Timeout`](crate::core::error::ErrorKind::Timeout)
    /// if `timeout` elapses first.
    pub async fn flush(&self, timeout: Duration) -> Result<(), Error> {
        let (reply, recv) = oneshot::channel();
        self.enqueue_command(HandlerCommand::Flush { reply })
            .await
            .map_err(|_| Error::new(crate::error::ErrorKind::ConnectionClosed).bubble("Client::flush"))?;

        match tokio::time::timeout(timeout, recv).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::new(crate::error::ErrorKind::ConnectionClosed).bubble("Client::flush")),
            Err(_elapsed) => Err(Error::new(crate::error::ErrorKind::Timeout).bubble("Client::flush")),
        }
    }

    pub(crate) fn create_inbox_subject(&self) -> Subject {
        create_inbox_subject(&self.inner.inbox_prefix)
    }

    pub(crate) fn default_response_timeout(&self) -> Duration {
        self.inner.default_response_timeout
    }

    pub(crate) fn lazy_unsubscribe_multiplexed(&self, reply_subject: Subject) {
        if self
            .try_enqueue_command(HandlerCommand::UnsubscribeMultiplexed { reply_subject })
            .is_ok()
        {
            return;
        }

        self.inner.quick_info.store_is_failed_unsubscribe(true);
    }

    pub(crate) async fn unsubscribe(
        &self,
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    ) -> Result<(), ClientClosedError> {
        self.enqueue_command(HandlerCommand::Unsubscribe { id, max_messages })
            .await
    }

    pub(crate) fn lazy_unsubscribe(&self, id: SubscriptionId, max_messages: Option<NonZeroU64>) {
        if self
            .try_enqueue_command(HandlerCommand::Unsubscribe { id, max_messages })
            .is_ok()
        {
            return;
        }

        self.inner.quick_info.store_is_failed_unsubscribe(true);
    }

    pub(super) async fn enqueue_command(
        &self,
        cmd: HandlerCommand,
    ) -> Result<(), ClientClosedError> {
        self.inner
            .sender
            .send(cmd)
            .await
            .map_err(|_| ClientClosedError)
    }

    pub(super) fn try_enqueue_command(&self, cmd: HandlerCommand) -> Result<(), TryCommandError> {
        self.inner
            .sender
            .try_send(cmd)
            .map_err(TryCommandError::from_try_send_error)
    }

    /// Admission check for a publish of `payload_len` bytes. Outside of
    /// [`ConnectionStatus::Reconnecting`] this always admits; while
    /// reconnecting, it's gated by
    /// [`ClientBuilder::max_reconnect_pending_bytes`].
    pub(super) fn admit_publish(&self, payload_len: u64) -> bool {
        if self.inner.status.get() != ConnectionStatus::Reconnecting {
            return true;
        }
        self.inner.reconnect_buffer.reserve(payload_len)
    }

    /// Close this client, waiting for any remaining buffered messages to be processed first
    ///
    /// Attempts to send commands to the NATS server after this method has been called will
    /// result into a [`ClientClosedError`] error.
    pub async fn close(&self) {
        let (sender, receiver) = oneshot::channel();
        if self
            .enqueue_command(HandlerCommand::Close(sender))
            .await
            .is_err()
        {
            return;
        }

        let _ = receiver.await;
        self.inner.status.store(ConnectionStatus::Closed);
        self.inner.runtime.callbacks.post(CallbackEvent::Closed);
        self.inner.runtime.close_and_wait(None).await;
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

impl TryCommandError {
    #[expect(
        clippy::needless_pass_by_value,
        reason = "this is an auxiliary conversion function"
    )]
    pub(crate) fn from_try_send_error<T>(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => Self::BufferFull,
            TrySendError::Closed(_) => Self::Closed(ClientClosedError),
        }
    }
}

pub(crate) fn create_inbox_subject(prefix: &Subject) -> Subject {
    let mut suffix = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut suffix);

    let mut subject = String::with_capacity(prefix.len() + ".".len() + (suffix.len() * 2));
    write!(&mut subject, "{}.{:x}", prefix, u128::from_ne_bytes(suffix)).unwrap();

    Subject::from_dangerous_value(subject.into())
}

/// Try every server in the pool, starting from the cursor, once each,
/// respecting [`ClientBuilder::connect_timeout`]. Returns the connected
/// handler and the address it landed on, or `None` if the whole pool was
/// exhausted.
async fn connect_from_pool(
    server_pool: &Arc<std::sync::Mutex<ServerPool>>,
    builder: &ClientBuilder,
    mut recycle: RecycledHandler,
    runtime: &Arc<Runtime>,
    statistics: &Arc<Statistics>,
) -> Option<(Handler, ServerAddr)> {
    let candidates = server_pool
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter_from_cursor()
        .map(|entry| entry.addr.clone())
        .collect::<Vec<_>>();

    for addr in candidates {
        server_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_auth_attempt(&addr);

        let attempt = tokio::time::timeout(
            builder.connect_timeout,
            Handler::connect(
                &addr,
                builder,
                recycle,
                Arc::clone(runtime),
                Arc::clone(server_pool),
                Arc::clone(statistics),
            ),
        )
        .await;

        match attempt {
            Ok(Ok(handle)) => {
                server_pool
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .advance_past(&addr);
                return Some((handle, addr));
            }
            Ok(Err((err, prev_recycle))) => {
                warn!(%addr, %err, "connection attempt failed");
                recycle = prev_recycle;
            }
            Err(_elapsed) => {
                warn!(%addr, "connection attempt timed out");
                return None;
            }
        }
    }

    None
}

/// The reconnect loop: runs the handler to completion, then (if allowed)
/// repeatedly tries the server pool until a new connection succeeds or
/// `max_reconnect` attempts are exhausted.
async fn run_connection_loop(
    mut handle: Handler,
    builder: ClientBuilder,
    server_pool: Arc<std::sync::Mutex<ServerPool>>,
    runtime: Arc<Runtime>,
    statistics: Arc<Statistics>,
    status: Arc<RawConnectionStatus>,
    reconnect_buffer: Arc<ReconnectBuffer>,
) {
    loop {
        match (&mut handle).await {
            HandlerOutput::ServerError | HandlerOutput::Disconnected => {
                status.store(ConnectionStatus::Disconnected);
                runtime.callbacks.post(CallbackEvent::Disconnected);

                if !builder.allow_reconnect {
                    let _ = handle.recycle().await;
                    return;
                }

                status.store(ConnectionStatus::Reconnecting);
                let recycle = handle.recycle().await;

                let Some(new_handle) = reconnect(
                    recycle,
                    &builder,
                    &server_pool,
                    &runtime,
                    &statistics,
                )
                .await
                else {
                    reconnect_buffer.reset();
                    status.store(ConnectionStatus::Closed);
                    runtime.callbacks.post(CallbackEvent::Closed);
                    return;
                };

                reconnect_buffer.reset();
                statistics.record_reconnect();
                status.store(ConnectionStatus::Connected);
                runtime.callbacks.post(CallbackEvent::Reconnected);
                handle = new_handle;
            }
            HandlerOutput::UnexpectedState => {
                // Retry and hope for the best
            }
            HandlerOutput::Closed => break,
        }
    }
}

/// Loop over the server pool, waiting [`ClientBuilder::reconnect_wait`]
/// between full passes, until a connection succeeds or
/// [`ClientBuilder::max_reconnect`] full passes have been attempted.
async fn reconnect(
    mut recycle: RecycledHandler,
    builder: &ClientBuilder,
    server_pool: &Arc<std::sync::Mutex<ServerPool>>,
    runtime: &Arc<Runtime>,
    statistics: &Arc<Statistics>,
) -> Option<Handler> {
    let mut attempts: u32 = 0;

    loop {
        if let Some(max_reconnect) = builder.max_reconnect {
            if attempts >= max_reconnect {
                return None;
            }
        }
        attempts += 1;

        let candidates = server_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter_from_cursor()
            .map(|entry| entry.addr.clone())
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            return None;
        }

        for addr in candidates {
            server_pool
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record_auth_attempt(&addr);

            match Handler::connect(
                &addr,
                builder,
                recycle,
                Arc::clone(runtime),
                Arc::clone(server_pool),
                Arc::clone(statistics),
            )
            .await
            {
                Ok(new_handle) => {
                    server_pool
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .advance_past(&addr);
                    return Some(new_handle);
                }
                Err((err, prev_recycle)) => {
                    warn!(%addr, %err, "reconnect attempt failed");
                    recycle = prev_recycle;
                }
            }
        }

        tokio::time::sleep(builder.reconnect_wait).await;
    }
}

#[cfg(test)]
mod shared_delivery_tests {
    use watermelon_proto::{headers::HeaderMap, MessageBase, ServerMessage, StatusCode, Subject};

    use super::Client;
    use crate::handler::HandlerCommand;

    #[tokio::test]
    async fn subscribe_with_handler_delivers_via_worker() {
        let (client, mut handler) = Client::test(4);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let shared = client
            .subscribe_with_handler(Subject::from_static("abcd.>"), None, move |msg| {
                let _ = tx.send(msg);
            })
            .await
            .unwrap();

        let HandlerCommand::SubscribeShared { id, worker, .. } =
            handler.receiver.try_recv().unwrap()
        else {
            unreachable!()
        };

        let message = ServerMessage {
            status_code: Some(StatusCode::OK),
            subscription_id: id,
            base: MessageBase {
                subject: Subject::from_static("abcd.x"),
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: bytes::Bytes::from_static(b"hi"),
            },
        };

        client
            .inner
            .runtime
            .workers
            .lock()
            .unwrap()
            .deliver(worker, id, message.clone());

        let delivered = rx.recv().await.unwrap();
        assert_eq!(Ok(message), delivered);

        shared.close().await.unwrap();
        assert!(matches!(
            handler.receiver.try_recv().unwrap(),
            HandlerCommand::Unsubscribe {
                id: unsub_id,
                max_messages: None,
            } if unsub_id == id
        ));
    }
}

#[cfg(test)]
mod flush_tests {
    use std::time::Duration;

    use super::Client;
    use crate::{error::ErrorKind, handler::HandlerCommand};

    #[tokio::test(start_paused = true)]
    async fn flush_resolves_once_pong_slot_is_answered() {
        let (client, mut handler) = Client::test(1);

        let flush = tokio::spawn(async move { client.flush(Duration::from_secs(5)).await });

        let HandlerCommand::Flush { reply } = handler.receiver.recv().await.unwrap() else {
            unreachable!()
        };
        reply.send(()).unwrap();

        assert!(flush.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_times_out_if_no_pong_arrives() {
        let (client, mut handler) = Client::test(1);

        let flush = tokio::spawn(async move { client.flush(Duration::from_millis(100)).await });

        let HandlerCommand::Flush { reply: _reply } = handler.receiver.recv().await.unwrap()
        else {
            unreachable!()
        };

        let err = flush.await.unwrap().unwrap_err();
        assert_eq!(ErrorKind::Timeout, err.kind());
    }
}
