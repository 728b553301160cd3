//! Connection Lifecycle Manager.
//!
//! A backend implements [`Connector`]; a [`ConnectionManager`] drives it
//! through connect-with-retry, post-connect initialization and the ready
//! broadcast, then keeps it alive with a background liveness loop that pings
//! on every tick and reconnects after a failure.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (Lost -> Reconnecting -> Connected)*
//! ```
//!
//! Connect errors are retried forever at the validation interval, with no
//! backoff growth. Only the first occurrence of a given error is logged at
//! `warn`; repeats drop to `debug`.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::error::DbError;
use crate::ready::ReadyBroadcast;

// =============================================================================
// Link status
// =============================================================================

/// Connection state of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Never connected.
    #[default]
    Disconnected,
    /// First connect in progress.
    Connecting,
    /// Connected and answering pings.
    Connected,
    /// A ping failed.
    Lost,
    /// Reconnect attempts in progress.
    Reconnecting,
}

/// Mutex-guarded [`LinkState`], read by request paths and written by the
/// liveness loop.
///
/// Transition methods report whether the state actually changed so callers
/// can log each transition exactly once.
#[derive(Debug, Default)]
pub struct LinkStatus {
    state: Mutex<LinkState>,
}

impl LinkStatus {
    /// Create a status in [`LinkState::Disconnected`].
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(&self, apply: impl FnOnce(LinkState) -> Option<LinkState>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match apply(*state) {
            Some(next) if next != *state => {
                *state = next;
                true
            }
            _ => false,
        }
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the backend is currently usable.
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Enter [`LinkState::Connecting`].
    pub fn begin_connect(&self) -> bool {
        self.transition(|_| Some(LinkState::Connecting))
    }

    /// Enter [`LinkState::Connected`]; `true` only when coming from another state.
    pub fn mark_connected(&self) -> bool {
        self.transition(|_| Some(LinkState::Connected))
    }

    /// Enter [`LinkState::Lost`]; `true` only when leaving `Connected`.
    pub fn mark_lost(&self) -> bool {
        self.transition(|current| (current == LinkState::Connected).then_some(LinkState::Lost))
    }

    /// Enter [`LinkState::Reconnecting`].
    pub fn begin_reconnect(&self) -> bool {
        self.transition(|_| Some(LinkState::Reconnecting))
    }
}

// =============================================================================
// Connector contract
// =============================================================================

/// Backend adapter driven by a [`ConnectionManager`].
///
/// Futures returned here must be `Send` so the manager can run them on a
/// spawned task.
pub trait Connector: Send + Sync + 'static {
    /// Connection parameters. Read fresh before every attempt, so an
    /// adapter may refine them between attempts.
    type Params: Clone + Send + Sync + 'static;

    /// Engine name used in logs.
    fn engine_name(&self) -> &'static str;

    /// Current connection parameters.
    fn connection_params(&self) -> Self::Params;

    /// Retry and liveness tick period.
    fn validation_interval(&self) -> Duration;

    /// Shared link status.
    fn status(&self) -> &LinkStatus;

    /// Open the connection.
    fn connect(&self, params: &Self::Params) -> impl Future<Output = Result<(), DbError>> + Send;

    /// One-time initialization after the first successful connect.
    fn after_connect(&self, params: &Self::Params) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Cheap round trip proving the connection works.
    fn ping(&self) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Re-establish a lost connection.
    fn reconnect(&self, params: &Self::Params) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Lifecycle message hook.
    fn log(&self, message: &str) {
        tracing::info!(engine = self.engine_name(), "{message}");
    }
}

// =============================================================================
// Manager
// =============================================================================

fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Supervises one [`Connector`] for the life of the process.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    ready: Arc<ReadyBroadcast>,
    liveness: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> core::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("engine", &self.connector.engine_name())
            .field("state", &self.connector.status().state())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager for `connector` that fires `ready` once connected.
    pub const fn new(connector: Arc<C>, ready: Arc<ReadyBroadcast>) -> Self {
        Self {
            connector,
            ready,
            liveness: Mutex::new(None),
        }
    }

    /// The supervised connector.
    pub const fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    /// Block until connected, then initialize, start the liveness loop and
    /// fire the ready broadcast.
    ///
    /// Connect failures are retried indefinitely. An `after_connect`
    /// failure is logged and does not hold back the broadcast. The result is
    /// that of the ready callbacks.
    pub async fn connect(&self) -> Result<(), DbError> {
        let connector = &*self.connector;
        let engine = connector.engine_name();
        let mut ticker = ticker(connector.validation_interval());
        ticker.tick().await;

        connector.status().begin_connect();
        let mut attempts: u64 = 0;
        let mut last_error: Option<String> = None;
        let params = loop {
            let params = connector.connection_params();
            attempts = attempts.saturating_add(1);
            match connector.connect(&params).await {
                Ok(()) => break params,
                Err(err) => {
                    let message = err.to_string();
                    if last_error.as_deref() == Some(message.as_str()) {
                        tracing::debug!(engine, attempts, error = %message, "Still unable to connect");
                    } else {
                        tracing::warn!(engine, attempts, error = %message, "Unable to connect; retrying");
                        last_error = Some(message);
                    }
                    ticker.tick().await;
                }
            }
        };

        connector.status().mark_connected();
        connector.log("connected");
        tracing::info!(engine, attempts, "Database connection established");

        if let Err(err) = connector.after_connect(&params).await {
            tracing::error!(engine, error = %err, "Post-connect initialization failed");
        }

        self.start_liveness();
        self.ready.fire().await
    }

    /// Run [`connect`](Self::connect) on a spawned task and return at once.
    pub fn connect_async(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = manager.connect().await {
                tracing::error!(
                    engine = manager.connector.engine_name(),
                    error = %err,
                    "Database ready callbacks failed"
                );
            }
        });
    }

    fn start_liveness(&self) {
        let connector = Arc::clone(&self.connector);
        let handle = tokio::spawn(liveness_loop(connector));
        let previous = self
            .liveness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        let handle = self
            .liveness
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

async fn liveness_loop<C: Connector>(connector: Arc<C>) {
    let engine = connector.engine_name();
    let status = connector.status();
    let mut ticker = ticker(connector.validation_interval());
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match connector.ping().await {
            Ok(()) => {
                if status.mark_connected() {
                    connector.log("connection restored");
                }
            }
            Err(err) => {
                if status.mark_lost() {
                    tracing::warn!(engine, error = %err, "Database connection lost");
                    connector.log("connection lost");
                }
                status.begin_reconnect();
                let params = connector.connection_params();
                match connector.reconnect(&params).await {
                    Ok(()) => {
                        if status.mark_connected() {
                            connector.log("connection restored");
                        }
                    }
                    Err(err) => tracing::debug!(engine, error = %err, "Reconnect failed; will retry"),
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tracing::Level;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use super::*;

    const PERIOD: Duration = Duration::from_secs(10);

    /// Connector whose failures are scripted.
    #[derive(Default)]
    struct Scripted {
        status: LinkStatus,
        connect_errors: Mutex<VecDeque<&'static str>>,
        connect_attempts: AtomicU32,
        ping_failures: AtomicU32,
        pings: AtomicU32,
        reconnect_failures: AtomicU32,
        reconnects: AtomicU32,
        messages: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn failing_connects(n: usize) -> Self {
            Self::connect_errors(&vec!["connection refused"; n])
        }

        fn connect_errors(errors: &[&'static str]) -> Self {
            let scripted = Self::default();
            scripted.connect_errors.lock().unwrap().extend(errors.iter().copied());
            scripted
        }

        fn count(&self, message: &str) -> usize {
            self.messages.lock().unwrap().iter().filter(|m| *m == message).count()
        }
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl Connector for Scripted {
        type Params = ();

        fn engine_name(&self) -> &'static str {
            "scripted"
        }

        fn connection_params(&self) -> Self::Params {}

        fn validation_interval(&self) -> Duration {
            PERIOD
        }

        fn status(&self) -> &LinkStatus {
            &self.status
        }

        async fn connect(&self, _params: &()) -> Result<(), DbError> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            let scripted = self.connect_errors.lock().unwrap().pop_front();
            scripted.map_or(Ok(()), |reason| Err(DbError::Config(reason.to_owned())))
        }

        async fn after_connect(&self, _params: &()) -> Result<(), DbError> {
            Err(DbError::Config("metadata table missing".to_owned()))
        }

        async fn ping(&self) -> Result<(), DbError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.ping_failures) {
                return Err(DbError::NotConnected("scripted"));
            }
            Ok(())
        }

        async fn reconnect(&self, _params: &()) -> Result<(), DbError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.reconnect_failures) {
                return Err(DbError::NotConnected("scripted"));
            }
            Ok(())
        }

        fn log(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_owned());
        }
    }

    /// Records the level and message of every event.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<(Level, String)>>>);

    impl Captured {
        fn count(&self, level: Level, message: &str) -> usize {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|(l, m)| *l == level && m == message)
                .count()
        }
    }

    #[derive(Default)]
    struct Message(String);

    impl Visit for Message {
        fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for Captured {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut message = Message::default();
            event.record(&mut message);
            self.0.lock().unwrap().push((*event.metadata().level(), message.0));
        }
    }

    fn manager(connector: Scripted) -> (Arc<ConnectionManager<Scripted>>, Arc<ReadyBroadcast>, Arc<AtomicU32>) {
        let ready = Arc::new(ReadyBroadcast::new());
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        ready.on_ready(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let manager = Arc::new(ConnectionManager::new(Arc::new(connector), Arc::clone(&ready)));
        (manager, ready, fired)
    }

    #[test]
    fn status_transitions_report_changes_once() {
        let status = LinkStatus::new();
        assert!(!status.mark_lost());
        assert!(status.mark_connected());
        assert!(!status.mark_connected());
        assert!(status.mark_lost());
        assert!(!status.mark_lost());
        assert!(status.begin_reconnect());
        assert!(!status.is_connected());
        assert!(status.mark_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_fires_once_after_connect_succeeds() {
        let (manager, ready, fired) = manager(Scripted::failing_connects(3));

        manager.connect().await.unwrap();

        let connector = manager.connector();
        assert_eq!(connector.connect_attempts.load(Ordering::SeqCst), 4);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(ready.has_fired());
        assert!(connector.status().is_connected());
        assert_eq!(connector.count("connected"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_waits_for_connect() {
        let (manager, ready, fired) = manager(Scripted::failing_connects(5));
        manager.connect_async();

        tokio::time::sleep(PERIOD * 2).await;
        assert!(!ready.has_fired());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(PERIOD * 4).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connector().connect_attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_connect_errors_warn_once() {
        let logs = Captured::default();
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(logs.clone()));
        let (manager, _ready, fired) = manager(Scripted::connect_errors(&[
            "connection refused",
            "connection refused",
            "connection refused",
            "timed out",
            "timed out",
        ]));

        manager.connect().await.unwrap();

        assert_eq!(manager.connector().connect_attempts.load(Ordering::SeqCst), 6);
        assert_eq!(logs.count(Level::WARN, "Unable to connect; retrying"), 2);
        assert_eq!(logs.count(Level::DEBUG, "Still unable to connect"), 3);
        assert_eq!(logs.count(Level::INFO, "Database connection established"), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restored_is_logged_once_per_outage() {
        let (manager, _ready, _fired) = manager(Scripted::default());
        manager.connect().await.unwrap();
        let connector = Arc::clone(manager.connector());
        connector.ping_failures.store(1, Ordering::SeqCst);

        // One failed ping (then reconnect), followed by several healthy ones.
        tokio::time::sleep(PERIOD * 5 + Duration::from_secs(1)).await;

        assert!(connector.pings.load(Ordering::SeqCst) >= 4);
        assert_eq!(connector.reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.count("connection lost"), 1);
        assert_eq!(connector.count("connection restored"), 1);
        assert!(connector.status().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnects_retry_until_restored() {
        let logs = Captured::default();
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(logs.clone()));
        let (manager, _ready, _fired) = manager(Scripted::default());
        manager.connect().await.unwrap();
        let connector = Arc::clone(manager.connector());
        connector.ping_failures.store(4, Ordering::SeqCst);
        connector.reconnect_failures.store(3, Ordering::SeqCst);

        // Two ticks into the outage: still reconnecting.
        tokio::time::sleep(PERIOD * 2 + Duration::from_secs(1)).await;
        assert_eq!(connector.status().state(), LinkState::Reconnecting);
        assert_eq!(connector.reconnects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.count("connection restored"), 0);

        // The fourth attempt succeeds; later pings are healthy.
        tokio::time::sleep(PERIOD * 4).await;
        assert_eq!(connector.reconnects.load(Ordering::SeqCst), 4);
        assert_eq!(connector.count("connection lost"), 1);
        assert_eq!(connector.count("connection restored"), 1);
        assert_eq!(logs.count(Level::WARN, "Database connection lost"), 1);
        assert_eq!(logs.count(Level::DEBUG, "Reconnect failed; will retry"), 3);
        assert!(connector.status().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_manager_stops_liveness() {
        let (manager, _ready, _fired) = manager(Scripted::default());
        manager.connect().await.unwrap();
        let connector = Arc::clone(manager.connector());
        drop(manager);

        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(connector.pings.load(Ordering::SeqCst), 0);
    }
}
