//! Geoawareness streaming client.
//!
//! [`GeoawarenessClient`] is a handle to a driver task. The driver owns the
//! connection machine, the reconnect timer, the live transport and the
//! fallback request; the handle only sends commands and reads the published
//! snapshot and telemetry.

use chrono::Utc;
use dashmap::DashSet;
use std::future::pending;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};

use geoaware_core::{parse_message, ConnectionTelemetry, NormalizeContext, Snapshot};

use crate::backoff::ReconnectBackoff;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::fallback::{fallback_url, FallbackFetcher};
use crate::machine::{Action, ConnectionMachine, RetryPolicy};
use crate::transport::{self, build_stream_url, TransportEvent, TransportHandle};

/// Delivered to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Snapshot(Arc<Snapshot>),
    Telemetry(ConnectionTelemetry),
    Error(ClientError),
}

/// Events buffered per subscriber before it starts missing them.
pub const SUBSCRIBER_CAPACITY: usize = 256;

/// Receiving end of [`GeoawarenessClient::subscribe`].
pub struct Subscription {
    id: u64,
    receiver: broadcast::Receiver<ClientEvent>,
    active: Arc<DashSet<u64>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or None once unsubscribed or the client has shut down.
    /// A subscriber that falls more than [`SUBSCRIBER_CAPACITY`] events
    /// behind skips the ones it missed.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        loop {
            if !self.active.contains(&self.id) {
                return None;
            }
            match self.receiver.recv().await {
                Ok(event) if self.active.contains(&self.id) => return Some(event),
                Ok(_) => return None,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Subscriber {} skipped {} events", self.id, missed);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Reconnect,
    SetSpaceId(String),
    Shutdown,
}

pub struct GeoawarenessClient {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Option<Arc<Snapshot>>>,
    telemetry: watch::Receiver<ConnectionTelemetry>,
    events: broadcast::Sender<ClientEvent>,
    subscribers: Arc<DashSet<u64>>,
    next_subscriber: AtomicU64,
    task: JoinHandle<()>,
}

impl GeoawarenessClient {
    /// Start the driver task. The client starts `Disconnected`; call
    /// [`connect`](Self::connect) to open the stream.
    pub fn spawn(config: ClientConfig) -> Result<Self, ClientError> {
        build_stream_url(&config.stream_url, &config.space_id)?;
        if config.fallback_enabled {
            fallback_url(&config.fallback_url, &config.space_id)?;
        }
        let fetcher = FallbackFetcher::new(config.fallback_timeout, config.auth_token.clone())?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (fallback_tx, fallback_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (telemetry_tx, telemetry_rx) = watch::channel(ConnectionTelemetry::default());
        let (events_tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);

        let machine = ConnectionMachine::new(RetryPolicy {
            max_retries: config.max_retries,
            backoff: ReconnectBackoff::new(config.base_delay, config.max_delay),
            fallback_enabled: config.fallback_enabled,
        });

        let driver = Driver {
            config,
            machine,
            transport: None,
            transport_tx,
            timer: None,
            fallback: None,
            fallback_tx,
            fetcher: Arc::new(fetcher),
            snapshot: snapshot_tx,
            telemetry: telemetry_tx,
            events: events_tx.clone(),
        };
        let task = tokio::spawn(driver.run(command_rx, transport_rx, fallback_rx));

        Ok(Self {
            commands: command_tx,
            snapshot: snapshot_rx,
            telemetry: telemetry_rx,
            events: events_tx,
            subscribers: Arc::new(DashSet::new()),
            next_subscriber: AtomicU64::new(1),
            task,
        })
    }

    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the stream and stop reconnecting until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    /// Watch a different space. Clears the current snapshot and reconnects.
    pub fn set_space_id(&self, space_id: impl Into<String>) {
        self.send(Command::SetSpaceId(space_id.into()));
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.borrow().clone()
    }

    pub fn telemetry(&self) -> ConnectionTelemetry {
        self.telemetry.borrow().clone()
    }

    /// Watch channel for the current snapshot, for callers that prefer
    /// `changed().await` over events.
    pub fn watch_snapshot(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id);
        Subscription {
            id,
            receiver: self.events.subscribe(),
            active: self.subscribers.clone(),
        }
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Stop the driver, closing the stream and dropping any pending fallback.
    pub async fn shutdown(self) {
        self.send(Command::Shutdown);
        if let Err(err) = self.task.await {
            tracing::warn!("Geoawareness driver ended abnormally: {}", err);
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Geoawareness driver is no longer running");
        }
    }
}

struct FallbackOutcome {
    epoch: u64,
    result: Result<Snapshot, ClientError>,
}

enum Input {
    Command(Option<Command>),
    Transport(TransportEvent),
    Fallback(FallbackOutcome),
    Timer,
}

struct Driver {
    config: ClientConfig,
    machine: ConnectionMachine,
    transport: Option<TransportHandle>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    timer: Option<Pin<Box<Sleep>>>,
    fallback: Option<JoinHandle<()>>,
    fallback_tx: mpsc::UnboundedSender<FallbackOutcome>,
    fetcher: Arc<FallbackFetcher>,
    snapshot: watch::Sender<Option<Arc<Snapshot>>>,
    telemetry: watch::Sender<ConnectionTelemetry>,
    events: broadcast::Sender<ClientEvent>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut fallback_rx: mpsc::UnboundedReceiver<FallbackOutcome>,
    ) {
        loop {
            // Both senders are held by the driver, so these never yield None.
            let input = tokio::select! {
                command = commands.recv() => Input::Command(command),
                Some(event) = transport_rx.recv() => Input::Transport(event),
                Some(outcome) = fallback_rx.recv() => Input::Fallback(outcome),
                _ = wait_timer(&mut self.timer) => Input::Timer,
            };

            match input {
                Input::Command(None) | Input::Command(Some(Command::Shutdown)) => break,
                Input::Command(Some(command)) => self.handle_command(command),
                Input::Transport(event) => self.handle_transport(event),
                Input::Fallback(outcome) => self.handle_fallback(outcome),
                Input::Timer => {
                    self.timer = None;
                    let actions = self.machine.on_timer();
                    self.apply(actions);
                }
            }
            self.publish_telemetry();
        }

        let actions = self.machine.disconnect();
        self.apply(actions);
        self.publish_telemetry();
        tracing::debug!("Geoawareness driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        let actions = match command {
            Command::Connect => self.machine.connect(),
            Command::Disconnect => {
                tracing::info!("Disconnecting from geoawareness stream");
                self.machine.disconnect()
            }
            Command::Reconnect => self.machine.reconnect(),
            Command::SetSpaceId(space_id) => {
                if space_id == self.config.space_id {
                    return;
                }
                tracing::info!(
                    "Switching geoawareness space {} -> {}",
                    self.config.space_id,
                    space_id
                );
                self.config.space_id = space_id;
                self.snapshot.send_replace(None);
                self.machine.change_space()
            }
            Command::Shutdown => return,
        };
        self.apply(actions);
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { generation } => {
                let actions = self.machine.on_opened(generation);
                self.apply(actions);
            }
            TransportEvent::Message { generation, text } => {
                if !self.machine.accepts_message(generation) {
                    return;
                }
                let received_at = Utc::now();
                let ctx = NormalizeContext::live(self.config.space_id.clone(), received_at);
                match parse_message(&text, &ctx) {
                    Ok(snapshot) => {
                        tracing::debug!(
                            "Snapshot for {} with {} zones",
                            snapshot.space_id,
                            snapshot.restricted_zones.len()
                        );
                        self.machine.record_message(received_at);
                        self.replace_snapshot(snapshot);
                    }
                    Err(err) => {
                        tracing::warn!("Discarding geoawareness message: {}", err);
                        self.broadcast(ClientEvent::Error(ClientError::Parse(err.to_string())));
                    }
                }
            }
            TransportEvent::Closed { generation, error } => {
                if !self.machine.is_current(generation) {
                    return;
                }
                if let Some(err) = error.as_deref() {
                    tracing::warn!("Geoawareness stream failed: {}", err);
                    self.broadcast(ClientEvent::Error(ClientError::Transport(err.to_string())));
                }
                let actions = self.machine.on_closed(generation, error);
                self.apply(actions);
            }
        }
    }

    fn handle_fallback(&mut self, outcome: FallbackOutcome) {
        self.fallback = None;
        let succeeded = outcome.result.is_ok();
        let apply = self.machine.on_fallback_finished(outcome.epoch, succeeded);

        match outcome.result {
            Ok(snapshot) if apply => {
                tracing::info!(
                    "Loaded {} zones for {} from fallback",
                    snapshot.restricted_zones.len(),
                    snapshot.space_id
                );
                self.replace_snapshot(snapshot);
            }
            Ok(_) => tracing::debug!("Discarding stale fallback result"),
            Err(err) => tracing::warn!("{}", err),
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::OpenTransport { generation } => self.open_transport(generation),
                Action::CloseTransport => {
                    if let Some(mut transport) = self.transport.take() {
                        tracing::debug!("Closing transport {}", transport.generation());
                        transport.close();
                    }
                }
                Action::ArmTimer { delay } => {
                    tracing::info!(
                        "Reconnecting in {:?} (attempt {})",
                        delay,
                        self.machine.retry_count()
                    );
                    self.timer = Some(Box::pin(sleep(delay)));
                }
                Action::CancelTimer => self.timer = None,
                Action::StartFallback { epoch } => self.start_fallback(epoch),
                Action::AbortFallback => {
                    if let Some(task) = self.fallback.take() {
                        task.abort();
                    }
                }
            }
        }
    }

    fn open_transport(&mut self, generation: u64) {
        match build_stream_url(&self.config.stream_url, &self.config.space_id) {
            Ok(url) => {
                tracing::debug!("Opening geoawareness stream {}", url);
                self.transport = Some(transport::open(
                    url,
                    self.config.auth_token.clone(),
                    generation,
                    self.transport_tx.clone(),
                ));
            }
            Err(err) => {
                let _ = self.transport_tx.send(TransportEvent::Closed {
                    generation,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    fn start_fallback(&mut self, epoch: u64) {
        let space_id = self.config.space_id.clone();
        let url = match fallback_url(&self.config.fallback_url, &space_id) {
            Ok(url) => url,
            Err(err) => {
                let _ = self.fallback_tx.send(FallbackOutcome {
                    epoch,
                    result: Err(err),
                });
                return;
            }
        };

        tracing::info!("Live retries exhausted, fetching zones from {}", url);
        let fetcher = self.fetcher.clone();
        let outcomes = self.fallback_tx.clone();
        self.fallback = Some(tokio::spawn(async move {
            let result = fetcher.fetch(url, &space_id).await;
            let _ = outcomes.send(FallbackOutcome { epoch, result });
        }));
    }

    fn replace_snapshot(&mut self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        self.snapshot.send_replace(Some(snapshot.clone()));
        self.broadcast(ClientEvent::Snapshot(snapshot));
    }

    /// Publish telemetry; subscribers are only told about connection changes,
    /// not every message timestamp.
    fn publish_telemetry(&mut self) {
        let current = self.machine.telemetry();
        let previous = self.telemetry.send_replace(current.clone());

        if previous.state != current.state {
            tracing::info!(
                "Geoawareness stream {:?} -> {:?} (space {})",
                previous.state,
                current.state,
                self.config.space_id
            );
        }

        let changed = previous.state != current.state
            || previous.retry_count != current.retry_count
            || previous.last_error != current.last_error
            || previous.using_fallback != current.using_fallback;
        if changed {
            self.broadcast(ClientEvent::Telemetry(current));
        }
    }

    fn broadcast(&self, event: ClientEvent) {
        // No receivers is not an error
        let _ = self.events.send(event);
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}
