//! # Block Download Service
//!
//! Runs the [`DownloadCoordinator`] on a single task. Three sources feed it:
//!
//! - the tick interval
//! - client commands sent through a [`DownloadHandle`]
//! - network events from the bus
//!
//! `tokio::select!` serializes them, so the coordinator needs no lock. After
//! every step the events the coordinator produced are published on the bus.

use std::sync::Arc;

use async_trait::async_trait;
use shared_bus::{EventFilter, EventPublisher, EventSubscriber, EventTopic, NetworkEvent, Subscription};
use shared_types::entities::BlockHash;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::coordinator::DownloadCoordinator;
use crate::config::DownloadConfig;
use crate::domain::{DownloadError, DownloadRequest, DownloadState, HistoryItem};
use crate::ports::{BlockDownloadApi, PeerStreams, TimeSource};

/// Maximum queued client commands.
pub const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Client command for the service task.
#[derive(Debug)]
enum Command {
    Download(DownloadRequest),
    Cancel(Vec<BlockHash>),
    Pause,
    Resume,
    State(oneshot::Sender<DownloadState>),
    History(BlockHash, oneshot::Sender<Vec<HistoryItem>>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Cloneable client handle of a running [`DownloadService`].
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    commands: mpsc::Sender<Command>,
}

impl DownloadHandle {
    async fn send(&self, command: Command) -> Result<(), DownloadError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DownloadError::ServiceStopped)
    }

    /// Ask the service to stop.
    pub async fn shutdown(&self) -> Result<(), DownloadError> {
        self.send(Command::Shutdown).await
    }

    /// Whether the service task has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

#[async_trait]
impl BlockDownloadApi for DownloadHandle {
    async fn download(&self, request: DownloadRequest) -> Result<(), DownloadError> {
        self.send(Command::Download(request)).await
    }

    async fn cancel_download(&self, hashes: Vec<BlockHash>) -> Result<(), DownloadError> {
        self.send(Command::Cancel(hashes)).await
    }

    async fn pause(&self) -> Result<(), DownloadError> {
        self.send(Command::Pause).await
    }

    async fn resume(&self) -> Result<(), DownloadError> {
        self.send(Command::Resume).await
    }

    async fn state(&self) -> Result<DownloadState, DownloadError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::State(tx)).await?;
        rx.await.map_err(|_| DownloadError::ResponseDropped)
    }

    async fn block_history(&self, hash: BlockHash) -> Result<Vec<HistoryItem>, DownloadError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::History(hash, tx)).await?;
        rx.await.map_err(|_| DownloadError::ResponseDropped)
    }
}

/// Block Download Service - owns the coordinator and drives it.
pub struct DownloadService<B: EventPublisher + EventSubscriber> {
    coordinator: DownloadCoordinator,
    bus: Arc<B>,
    events: Subscription,
    commands: mpsc::Receiver<Command>,
    clock: Arc<dyn TimeSource>,
}

impl<B: EventPublisher + EventSubscriber> DownloadService<B> {
    /// Create the service and its client handle.
    ///
    /// The bus subscription is taken here, so events published before
    /// [`run`](Self::run) starts are not lost.
    pub fn new(
        config: DownloadConfig,
        bus: Arc<B>,
        streams: Arc<dyn PeerStreams>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<(Self, DownloadHandle), DownloadError> {
        let coordinator = DownloadCoordinator::new(config, streams)?;
        let events = bus.subscribe(EventFilter::topics(vec![
            EventTopic::Session,
            EventTopic::Peers,
            EventTopic::Inventory,
            EventTopic::BlockDelivery,
        ]));
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let service = Self {
            coordinator,
            bus,
            events,
            commands: rx,
            clock,
        };
        Ok((service, DownloadHandle { commands: tx }))
    }

    /// Run until shutdown, `NetStopped`, or until every handle and the bus
    /// are gone.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.coordinator.config().tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            tick_ms = self.coordinator.config().tick_interval_ms,
            "Block download service started"
        );

        loop {
            let flow = tokio::select! {
                _ = ticker.tick() => {
                    self.coordinator.tick(self.clock.now());
                    Flow::Continue
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All download handles dropped");
                        Flow::Stop
                    }
                },
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!("Event bus closed");
                        Flow::Stop
                    }
                },
            };

            self.flush().await;
            if flow == Flow::Stop {
                break;
            }
        }

        info!("Block download service stopped");
    }

    fn handle_command(&mut self, command: Command) -> Flow {
        let now = self.clock.now();
        match command {
            Command::Download(request) => self.coordinator.download(request, now),
            Command::Cancel(hashes) => self.coordinator.cancel(&hashes, now),
            Command::Pause => self.coordinator.pause(),
            Command::Resume => self.coordinator.resume(),
            Command::State(reply) => {
                // The caller may have given up waiting.
                let _ = reply.send(self.coordinator.state());
            }
            Command::History(hash, reply) => {
                let _ = reply.send(self.coordinator.block_history(&hash));
            }
            Command::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    fn handle_event(&mut self, event: NetworkEvent) -> Flow {
        let stop = matches!(event, NetworkEvent::NetStopped);
        self.coordinator.handle_event(event, self.clock.now());
        if stop {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    async fn flush(&mut self) {
        for event in self.coordinator.drain_events() {
            self.bus.publish(event).await;
        }
    }
}
