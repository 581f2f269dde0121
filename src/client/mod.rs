use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::config::{BackoffConfig, DispatchMode, GatewayConfig};
use crate::error::ClientError;
use crate::event::EventHandler;
use crate::gateway::{
    ConnectionStatus, Connector, EventDispatcher, Gateway, GatewayWriter, HandlerRegistry,
    SessionState, WsConnector,
};
use crate::http::{Http, ReqwestRest, RestClient};
use crate::model::{Entity, House, Room, User};

/// What the client authenticates with.
#[derive(Clone)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    /// Reads the token from `HIVEN_TOKEN`.
    pub fn from_env() -> Result<Self, ClientError> {
        std::env::var("HIVEN_TOKEN")
            .map(Self::new)
            .map_err(|_| ClientError::Auth("HIVEN_TOKEN is not set".into()))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn validate(&self) -> Result<(), ClientError> {
        if self.token.trim().is_empty() {
            return Err(ClientError::Auth("empty token".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("token", &"<redacted>").finish()
    }
}

impl From<String> for Credentials {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

impl From<&str> for Credentials {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

/// Handed to every event handler.
#[derive(Clone)]
pub struct Context {
    pub http: Arc<Http>,
    pub cache: Arc<Cache>,
    pub(crate) session: Arc<SessionState>,
    pub(crate) shutdown: CancellationToken,
}

impl Context {
    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.session.sequence()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.session.latency()
    }

    /// Asks the client to shut down. Returns immediately, so it is safe to
    /// call from inside a handler.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        use async_trait::async_trait;
        use reqwest::Method;
        use serde_json::Value;

        struct Offline;

        #[async_trait]
        impl RestClient for Offline {
            async fn request(
                &self,
                _method: Method,
                _path: &str,
                _body: Option<&Value>,
                _token: &str,
            ) -> Result<crate::http::RestResponse, ClientError> {
                Err(ClientError::NotConnected)
            }
        }

        let session = Arc::new(SessionState::new());
        Self {
            http: Arc::new(Http::new(Arc::new(Offline), session.clone())),
            cache: Arc::new(Cache::new()),
            session,
            shutdown: CancellationToken::new(),
        }
    }
}

pub struct ClientBuilder {
    config: GatewayConfig,
    connector: Option<Arc<dyn Connector>>,
    rest: Option<Arc<dyn RestClient>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            connector: None,
            rest: None,
        }
    }

    /// Replaces every setting at once, e.g. with [`GatewayConfig::from_env`].
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = url.into();
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = Some(interval);
        self
    }

    pub fn heartbeat_ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_ack_timeout = Some(timeout);
        self
    }

    pub fn missed_heartbeat_limit(mut self, limit: u32) -> Self {
        self.config.missed_heartbeat_limit = limit;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.backoff = BackoffConfig {
            initial,
            max,
            ..self.config.backoff
        };
        self
    }

    /// 0 means keep trying forever.
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.config.dispatch_mode = mode;
        self
    }

    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn rest_client(mut self, rest: impl RestClient + 'static) -> Self {
        self.rest = Some(Arc::new(rest));
        self
    }

    pub fn build(self) -> Result<Client, ClientError> {
        self.config.validate()?;

        // Already installed is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let rest: Arc<dyn RestClient> = match self.rest {
            Some(rest) => rest,
            None => Arc::new(ReqwestRest::new(
                self.config.api_url.clone(),
                self.config.request_timeout,
            )?),
        };
        let session = Arc::new(SessionState::new());

        Ok(Client {
            inner: Arc::new(ClientInner {
                http: Arc::new(Http::new(rest, session.clone())),
                writer: Arc::new(GatewayWriter::new(self.config.write_timeout)),
                connector: self.connector.unwrap_or_else(|| Arc::new(WsConnector)),
                registry: Arc::new(HandlerRegistry::new()),
                cache: Arc::new(Cache::new()),
                config: Arc::new(self.config),
                session,
                shutdown: Mutex::new(CancellationToken::new()),
                running: AtomicBool::new(false),
            }),
        })
    }
}

struct ClientInner {
    config: Arc<GatewayConfig>,
    http: Arc<Http>,
    session: Arc<SessionState>,
    writer: Arc<GatewayWriter>,
    connector: Arc<dyn Connector>,
    registry: Arc<HandlerRegistry>,
    cache: Arc<Cache>,
    /// Token of the latest `run`/`connect`; `close()` cancels it.
    shutdown: Mutex<CancellationToken>,
    running: AtomicBool,
}

/// A Hiven client. Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Clears the running flag however a session ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Registers `handler` for `event`. Handlers of one event run in the
    /// order they were registered; this works while the client is running.
    pub fn on(&self, event: &str, handler: impl EventHandler + 'static) -> &Self {
        self.inner.registry.register(event, Arc::new(handler));
        self
    }

    pub fn http(&self) -> Arc<Http> {
        self.inner.http.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.session.status()
    }

    pub fn session(&self) -> Arc<SessionState> {
        self.inner.session.clone()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> Arc<Cache> {
        self.inner.cache.clone()
    }

    /// The logged in account, once READY arrived.
    pub fn client_user(&self) -> Option<User> {
        self.inner.cache.client_user()
    }

    /// Cached user; use [`Http::get_user`] to fetch one.
    pub fn get_user(&self, user_id: &str) -> Option<User> {
        self.inner.cache.user(user_id)
    }

    pub fn get_house(&self, house_id: &str) -> Option<House> {
        self.inner.cache.house(house_id)
    }

    pub fn get_room(&self, room_id: &str) -> Option<Room> {
        self.inner.cache.room(room_id)
    }

    pub fn get_entity(&self, entity_id: &str) -> Option<Entity> {
        self.inner.cache.entity(entity_id)
    }

    /// Runs the session until [`close`](Client::close) is called or a fatal
    /// error occurs. Connection failures, including the very first one, are
    /// retried with backoff.
    ///
    /// The session is bound to `close()` as soon as this is called, so a
    /// `close()` issued before the returned future is first polled still
    /// stops it.
    pub fn run(
        &self,
        credentials: impl Into<Credentials>,
    ) -> impl Future<Output = Result<(), ClientError>> + Send + 'static {
        let shutdown = self.arm_shutdown();
        let credentials = credentials.into();
        let client = self.clone();
        async move { client.run_session(credentials, shutdown, false).await }
    }

    /// Connects and waits for `Ready`. Unlike [`run`](Client::run) a failure
    /// of this first connection is returned (`Auth`, transport errors,
    /// timeouts). Afterwards the session keeps running in the background and
    /// reconnects on its own; the returned handle resolves when it ends.
    pub fn connect(
        &self,
        credentials: impl Into<Credentials>,
    ) -> impl Future<Output = Result<JoinHandle<Result<(), ClientError>>, ClientError>> + Send + 'static
    {
        let shutdown = self.arm_shutdown();
        let credentials = credentials.into();
        let client = self.clone();
        async move {
            credentials.validate()?;

            let mut status = client.inner.session.subscribe();
            let session = client.clone();
            let mut task =
                tokio::spawn(async move { session.run_session(credentials, shutdown, true).await });

            let outcome = tokio::select! {
                ready = status.wait_for(|s| *s == ConnectionStatus::Ready) => {
                    match ready.map(|_| ()) {
                        Ok(()) => None,
                        Err(_) => Some(Err(ClientError::ConnectionClosed)),
                    }
                }
                finished = &mut task => Some(match finished {
                    Ok(Ok(())) => Err(ClientError::ConnectionClosed),
                    Ok(Err(e)) => Err(e),
                    Err(join) => Err(ClientError::Handler {
                        event: "connect".into(),
                        message: join.to_string(),
                    }),
                }),
            };
            match outcome {
                None => Ok(task),
                Some(result) => result.map(|()| task),
            }
        }
    }

    /// Hands out the token for a new session. A token cancelled by an
    /// earlier `close()` is replaced; a live one is shared.
    fn arm_shutdown(&self) -> CancellationToken {
        let mut token = self.inner.shutdown.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    /// Shuts the session down and waits, at most `close_timeout`, until the
    /// connection is released.
    pub async fn close(&self) {
        self.inner.shutdown.lock().cancel();
        if self.inner.running.load(Ordering::SeqCst) {
            let closed = self
                .inner
                .session
                .wait_for_status(ConnectionStatus::Disconnected, self.inner.config.close_timeout)
                .await;
            if !closed {
                log::warn!("Gateway did not close within {:?}", self.inner.config.close_timeout);
            }
        }
    }

    async fn run_session(
        &self,
        credentials: Credentials,
        shutdown: CancellationToken,
        initial_must_succeed: bool,
    ) -> Result<(), ClientError> {
        credentials.validate()?;
        if shutdown.is_cancelled() {
            log::info!("Client closed before the session started");
            return Ok(());
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Config("client is already running".into()));
        }
        let _running = RunningGuard(&self.inner.running);

        self.inner.http.authorize(credentials.token());
        let ctx = Context {
            http: self.inner.http.clone(),
            cache: self.inner.cache.clone(),
            session: self.inner.session.clone(),
            shutdown: shutdown.clone(),
        };
        let dispatcher = EventDispatcher::new(
            self.inner.registry.clone(),
            self.inner.session.clone(),
            self.inner.config.dispatch_mode,
            self.inner.config.event_queue_capacity,
        );
        let gateway = Gateway {
            config: self.inner.config.clone(),
            connector: self.inner.connector.clone(),
            session: self.inner.session.clone(),
            cache: self.inner.cache.clone(),
            writer: self.inner.writer.clone(),
            shutdown,
        };

        let result = gateway
            .run(credentials.token(), &dispatcher, &ctx, initial_must_succeed)
            .await;
        dispatcher.shutdown(self.inner.config.close_timeout).await;
        result
    }
}
