use std::{fmt, sync::Arc, time::Duration};

use watermelon_mini::AuthenticationMethod;
use watermelon_proto::{ServerAddr, Subject};

#[cfg(feature = "from-env")]
use super::from_env::FromEnv;
use crate::core::Client;
use crate::runtime::DeliveryModel;

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_PINGS_OUT: u8 = 2;
const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_PENDING_MSGS: u64 = 64 * 1024;
const DEFAULT_MAX_PENDING_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_MAX_RECONNECT_PENDING_BYTES: u64 = 8 * 1024 * 1024;

/// A builder for [`Client`]
///
/// Obtained from [`Client::builder`].
pub struct ClientBuilder {
    pub(crate) auth_method: Option<AuthenticationMethod>,
    pub(crate) flush_interval: Duration,
    pub(crate) inbox_prefix: Subject,
    pub(crate) echo: Echo,
    pub(crate) default_response_timeout: Duration,
    #[cfg(feature = "non-standard-zstd")]
    pub(crate) non_standard_zstd: bool,

    pub(crate) servers: Vec<ServerAddr>,
    pub(crate) randomize_servers: bool,
    pub(crate) verbose: bool,
    pub(crate) pedantic: bool,
    pub(crate) ping_interval: Duration,
    pub(crate) max_pings_out: u8,
    pub(crate) allow_reconnect: bool,
    pub(crate) max_reconnect: Option<u32>,
    pub(crate) reconnect_wait: Duration,
    pub(crate) max_pending_messages_per_subscription: u64,
    pub(crate) max_pending_bytes_per_subscription: u64,
    pub(crate) max_reconnect_pending_bytes: u64,
    pub(crate) connect_timeout: Duration,
    pub(crate) connection_name: Option<String>,
    pub(crate) delivery_model: DeliveryModel,
    pub(crate) callbacks: Callbacks,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("auth_method", &self.auth_method)
            .field("flush_interval", &self.flush_interval)
            .field("inbox_prefix", &self.inbox_prefix)
            .field("echo", &self.echo)
            .field("default_response_timeout", &self.default_response_timeout)
            .field("servers", &self.servers)
            .field("randomize_servers", &self.randomize_servers)
            .field("verbose", &self.verbose)
            .field("pedantic", &self.pedantic)
            .field("ping_interval", &self.ping_interval)
            .field("max_pings_out", &self.max_pings_out)
            .field("allow_reconnect", &self.allow_reconnect)
            .field("max_reconnect", &self.max_reconnect)
            .field("reconnect_wait", &self.reconnect_wait)
            .field(
                "max_pending_messages_per_subscription",
                &self.max_pending_messages_per_subscription,
            )
            .field(
                "max_pending_bytes_per_subscription",
                &self.max_pending_bytes_per_subscription,
            )
            .field(
                "max_reconnect_pending_bytes",
                &self.max_reconnect_pending_bytes,
            )
            .field("connect_timeout", &self.connect_timeout)
            .field("connection_name", &self.connection_name)
            .field("delivery_model", &self.delivery_model)
            .finish_non_exhaustive()
    }
}

/// Whether or not to allow messages published by this client to be echoed back to it's own subscriptions
#[derive(Debug, Copy, Clone, Default)]
pub enum Echo {
    /// Do not allow messages published by this client to be echoed back to it's own [`Subscription`]s
    ///
    /// [`Subscription`]: crate::core::Subscription
    #[default]
    Prevent,
    /// Allow messages published by this client to be echoed back to it's own [`Subscription`]s
    ///
    /// [`Subscription`]: crate::core::Subscription
    Allow,
}

type ConnectedCallback = Box<dyn Fn() + Send + Sync>;
type DisconnectedCallback = Box<dyn Fn() + Send + Sync>;
type ReconnectedCallback = Box<dyn Fn() + Send + Sync>;
type ClosedCallback = Box<dyn Fn() + Send + Sync>;
type LameDuckCallback = Box<dyn Fn() + Send + Sync>;
type DiscoveredServersCallback = Box<dyn Fn(&[ServerAddr]) + Send + Sync>;
type AsyncErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// User-registered callbacks invoked by the async-callback pump as the
/// connection moves through its lifecycle.
///
/// None of these callbacks ever run on the reader, writer or timer task;
/// they're all dispatched from the dedicated callback pump task.
#[derive(Default)]
pub struct Callbacks {
    pub(crate) on_connected: Option<ConnectedCallback>,
    pub(crate) on_disconnected: Option<DisconnectedCallback>,
    pub(crate) on_reconnected: Option<ReconnectedCallback>,
    pub(crate) on_closed: Option<ClosedCallback>,
    pub(crate) on_lame_duck: Option<LameDuckCallback>,
    pub(crate) on_discovered_servers: Option<DiscoveredServersCallback>,
    pub(crate) on_async_error: Option<AsyncErrorCallback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .field("on_reconnected", &self.on_reconnected.is_some())
            .field("on_closed", &self.on_closed.is_some())
            .field("on_lame_duck", &self.on_lame_duck.is_some())
            .field(
                "on_discovered_servers",
                &self.on_discovered_servers.is_some(),
            )
            .field("on_async_error", &self.on_async_error.is_some())
            .finish()
    }
}

impl ClientBuilder {
    pub(super) fn new() -> Self {
        Self {
            auth_method: None,
            flush_interval: Duration::ZERO,
            inbox_prefix: Subject::from_static("_INBOX"),
            echo: Echo::Prevent,
            default_response_timeout: Duration::from_secs(5),
            #[cfg(feature = "non-standard-zstd")]
            non_standard_zstd: true,

            servers: Vec::new(),
            randomize_servers: true,
            verbose: false,
            pedantic: false,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_out: DEFAULT_MAX_PINGS_OUT,
            allow_reconnect: true,
            max_reconnect: None,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            max_pending_messages_per_subscription: DEFAULT_MAX_PENDING_MSGS,
            max_pending_bytes_per_subscription: DEFAULT_MAX_PENDING_BYTES,
            max_reconnect_pending_bytes: DEFAULT_MAX_RECONNECT_PENDING_BYTES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection_name: None,
            delivery_model: default_delivery_model(),
            callbacks: Callbacks::default(),
        }
    }

    /// Construct [`ClientBuilder`] from environment variables
    ///
    /// Reads the following environment variables into [`ClientBuilder`]:
    ///
    /// Authentication:
    ///
    /// * `NATS_JWT` and `NATS_NKEY`: use nkey authentication
    /// * `NATS_CREDS_FILE`: read JWT and NKEY from the provided `.creds` file
    /// * `NATS_USERNAME` and `NATS_PASSWORD`: use username and password authentication
    ///
    /// Plus `NATS_DEFAULT_LIB_WRITE_DEADLINE` (milliseconds, maps to
    /// [`ClientBuilder::connect_timeout`]) and
    /// `NATS_DEFAULT_TO_LIB_MSG_DELIVERY` (any value selects
    /// [`DeliveryModel::SharedPool`] as the default).
    ///
    /// # Panics
    ///
    /// It panics if:
    ///
    /// - it is not possible to get the environment variables;
    /// - an error occurs when trying to read the credentials file;
    /// - the credentials file is invalid.
    #[cfg(feature = "from-env")]
    #[must_use]
    pub fn from_env() -> Self {
        use super::from_env;

        let env = envy::from_env::<FromEnv>().expect("FromEnv deserialization error");

        let mut this = Self::new();

        match env.auth {
            from_env::AuthenticationMethod::Creds { jwt, nkey } => {
                this = this.authentication_method(Some(AuthenticationMethod::Creds { jwt, nkey }));
            }
            from_env::AuthenticationMethod::CredsFile { creds_file } => {
                let contents = std::fs::read_to_string(creds_file).expect("read credentials file");
                let auth =
                    AuthenticationMethod::from_creds(&contents).expect("parse credentials file");
                this = this.authentication_method(Some(auth));
            }
            from_env::AuthenticationMethod::UserAndPassword { username, password } => {
                this = this.authentication_method(Some(AuthenticationMethod::UserAndPassword {
                    username,
                    password,
                }));
            }
            from_env::AuthenticationMethod::None => {
                this = this.authentication_method(None);
            }
        }

        if let Some(inbox_prefix) = env.inbox_prefix {
            this = this.inbox_prefix(inbox_prefix);
        }

        if let Some(deadline_ms) = env.nats_default_lib_write_deadline {
            this = this.connect_timeout(Duration::from_millis(deadline_ms));
        }

        if env.nats_default_to_lib_msg_delivery.is_some() {
            this = this.delivery_model(DeliveryModel::SharedPool {
                size: num_cpus_hint(),
            });
        }

        this
    }

    /// Define an authentication method
    #[must_use]
    pub fn authentication_method(mut self, auth_method: Option<AuthenticationMethod>) -> Self {
        self.auth_method = auth_method;
        self
    }

    /// Define a flush interval
    ///
    /// Setting a non-zero flush interval allows the client to generate
    /// larger TLS and TCP packets at the cost of increased latency. Using
    /// a value greater than a few seconds may break the client in
    /// unexpected ways.
    ///
    /// Setting this to [`Duration::ZERO`] causes the client to send messages
    /// as fast as the network will allow, trading off smaller packets for
    /// lower latency.
    ///
    /// Default: 0
    #[must_use]
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Configure the inbox prefix to which replies from the NATS server will be received
    ///
    /// Default: `_INBOX`
    #[must_use]
    pub fn inbox_prefix(mut self, inbox_prefix: Subject) -> Self {
        self.inbox_prefix = inbox_prefix;
        self
    }

    /// Whether or not to allow messages published by this client to be echoed back to it's own [`Subscription`]s
    ///
    /// Setting this option to [`Echo::Allow`] will allow [`Subscription`]s created by
    /// this client to receive messages by itself published.
    ///
    /// Default: [`Echo::Prevent`].
    ///
    /// [`Subscription`]: crate::core::Subscription
    #[must_use]
    pub fn echo(mut self, echo: Echo) -> Self {
        self.echo = echo;
        self
    }

    /// The default timeout for [`ResponseFut`]
    ///
    /// Defines how long we should wait for a response in [`Client::request`].
    ///
    /// Default: 5 seconds.
    ///
    /// [`ResponseFut`]: crate::core::request::ResponseFut
    #[must_use]
    pub fn default_response_timeout(mut self, timeout: Duration) -> Self {
        self.default_response_timeout = timeout;
        self
    }

    /// Add extra candidate servers to the pool, in addition to the address
    /// passed to [`ClientBuilder::connect`].
    ///
    /// Default: empty.
    #[must_use]
    pub fn servers(mut self, servers: Vec<ServerAddr>) -> Self {
        self.servers = servers;
        self
    }

    /// Whether to shuffle the server pool before the first connection
    /// attempt.
    ///
    /// Default: `true`.
    #[must_use]
    pub fn randomize_servers(mut self, randomize: bool) -> Self {
        self.randomize_servers = randomize;
        self
    }

    /// Request verbose acknowledgements (`+OK`) from the server.
    ///
    /// Default: `false`.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Ask the server to validate subjects strictly.
    ///
    /// Default: `false`.
    #[must_use]
    pub fn pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    /// How often to send a `PING` to the server to detect a stale
    /// connection.
    ///
    /// Default: 10 seconds.
    #[must_use]
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    /// How many outstanding `PING`s may go unanswered before the connection
    /// is considered stale and a reconnect is triggered.
    ///
    /// Default: 2.
    #[must_use]
    pub fn max_pings_out(mut self, max_pings_out: u8) -> Self {
        self.max_pings_out = max_pings_out;
        self
    }

    /// Whether to attempt reconnecting after the connection is lost.
    ///
    /// Default: `true`.
    #[must_use]
    pub fn allow_reconnect(mut self, allow_reconnect: bool) -> Self {
        self.allow_reconnect = allow_reconnect;
        self
    }

    /// Maximum number of reconnect attempts (counted per full pass over the
    /// server pool) before giving up and closing the client. `None` retries
    /// forever.
    ///
    /// Default: unbounded.
    #[must_use]
    pub fn max_reconnect(mut self, max_reconnect: Option<u32>) -> Self {
        self.max_reconnect = max_reconnect;
        self
    }

    /// How long to wait between reconnect attempts.
    ///
    /// Default: 10 seconds.
    #[must_use]
    pub fn reconnect_wait(mut self, reconnect_wait: Duration) -> Self {
        self.reconnect_wait = reconnect_wait;
        self
    }

    /// Maximum number of undelivered messages a subscription may have
    /// pending before it is marked a slow consumer and further messages are
    /// dropped.
    ///
    /// Default: 65536.
    #[must_use]
    pub fn max_pending_messages_per_subscription(mut self, max: u64) -> Self {
        self.max_pending_messages_per_subscription = max;
        self
    }

    /// Maximum number of undelivered payload bytes a subscription may have
    /// pending before it is marked a slow consumer and further messages are
    /// dropped.
    ///
    /// Default: 64 MiB.
    #[must_use]
    pub fn max_pending_bytes_per_subscription(mut self, max: u64) -> Self {
        self.max_pending_bytes_per_subscription = max;
        self
    }

    /// Maximum number of payload bytes buffered for publishes issued while
    /// the connection is reconnecting. Exceeding this returns
    /// [`ErrorKind::InsufficientBuffer`](crate::core::error::ErrorKind::InsufficientBuffer).
    ///
    /// Default: 8 MiB.
    #[must_use]
    pub fn max_reconnect_pending_bytes(mut self, max: u64) -> Self {
        self.max_reconnect_pending_bytes = max;
        self
    }

    /// How long to wait for the initial `CONNECT`/`INFO` handshake with a
    /// single server before trying the next one in the pool.
    ///
    /// Default: 10 seconds.
    #[must_use]
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// An optional human-readable name sent to the server in `CONNECT`,
    /// surfaced in the server's connection listing.
    #[must_use]
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Select which delivery model new subscriptions use by default.
    ///
    /// Default: [`DeliveryModel::PerSubscription`], unless the
    /// `NATS_DEFAULT_TO_LIB_MSG_DELIVERY` environment variable is set and
    /// [`ClientBuilder::from_env`] was used to build this configuration.
    #[must_use]
    pub fn delivery_model(mut self, delivery_model: DeliveryModel) -> Self {
        self.delivery_model = delivery_model;
        self
    }

    /// Register a callback invoked after the initial connection completes.
    #[must_use]
    pub fn on_connected<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_connected = Some(Box::new(f));
        self
    }

    /// Register a callback invoked when the connection is lost and a
    /// reconnect attempt begins.
    #[must_use]
    pub fn on_disconnected<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_disconnected = Some(Box::new(f));
        self
    }

    /// Register a callback invoked after a reconnect succeeds.
    #[must_use]
    pub fn on_reconnected<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_reconnected = Some(Box::new(f));
        self
    }

    /// Register a callback invoked once [`Client::close`] has fully drained.
    #[must_use]
    pub fn on_closed<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_closed = Some(Box::new(f));
        self
    }

    /// Register a callback invoked when the server announces Lame Duck Mode.
    #[must_use]
    pub fn on_lame_duck<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_lame_duck = Some(Box::new(f));
        self
    }

    /// Register a callback invoked when new servers are discovered via
    /// `INFO`.
    #[must_use]
    pub fn on_discovered_servers<F>(mut self, f: F) -> Self
    where
        F: Fn(&[ServerAddr]) + Send + Sync + 'static,
    {
        self.callbacks.on_discovered_servers = Some(Box::new(f));
        self
    }

    /// Register a callback invoked for asynchronous errors (e.g. a slow
    /// consumer) that aren't tied to a specific synchronous call.
    #[must_use]
    pub fn on_async_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_async_error = Some(Box::new(f));
        self
    }

    /// Have the client compress the connection using zstd when talking to a NATS server
    /// behind a custom zstd proxy
    ///
    /// The NATS protocol and applications developed on top of it can make inefficient
    /// use of the network, making applications running on extremely slow or expensive internet
    /// connections infeasible. This option adds a non-standard zstd compression
    /// feature on top of the client which, when used in conjunction with a custom zstd reverse proxy
    /// put in from of the NATS server allows for large bandwidth savings.
    ///
    /// This option is particularly powerful when combined with [`ClientBuilder::flush_interval`].
    ///
    /// This option is automatically disabled when connecting to an unsupported server.
    ///
    /// Default: `true` when compiled with the `non-standard-zstd` option.
    #[cfg(feature = "non-standard-zstd")]
    #[must_use]
    pub fn non_standard_zstd(mut self, non_standard_zstd: bool) -> Self {
        self.non_standard_zstd = non_standard_zstd;
        self
    }

    /// Creates a new [`Client`], connecting to the given address.
    ///
    /// Any additional servers configured via [`ClientBuilder::servers`] are
    /// tried, in pool order, if `addr` cannot be reached.
    ///
    /// # Errors
    ///
    /// It returns an error if no server in the pool could be reached.
    pub async fn connect(mut self, addr: ServerAddr) -> Result<Client, crate::core::error::Error> {
        if !self.servers.contains(&addr) {
            self.servers.insert(0, addr);
        }
        Client::connect(self).await
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_delivery_model() -> DeliveryModel {
    DeliveryModel::PerSubscription
}

fn num_cpus_hint() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

#[allow(dead_code)]
fn _assert_callbacks_is_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<Arc<Callbacks>>();
}
