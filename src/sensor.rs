//! Sensor session actor.
//!
//! [`SensorConnection`] runs the [`ConnectionStateMachine`] on a dedicated
//! tokio task. Commands and transport events are both funnelled into that
//! task, so connection state and the pending descriptor writes have a single
//! writer and a late acknowledgment can never race a disconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::authorization::Authorization;
use crate::ble::connection::{ConnectionConfig, ConnectionState, ConnectionStateMachine};
use crate::ble::transport::{GattTransport, TransportEvent};
use crate::data::{Device, MeasurementChannel, Reading};
use crate::error::{Error, Result};
use crate::publisher::ReadingPublisher;

/// Callback handle for unregistering callbacks.
///
/// The callback is unregistered when the handle is dropped.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

enum Command {
    Connect {
        device: Device,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Read {
        channel: MeasurementChannel,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the task owning the sensor connection.
pub struct SensorConnection {
    commands: mpsc::Sender<Command>,
    publisher: Arc<ReadingPublisher>,
    callback_counter: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SensorConnection {
    /// Spawn the session task.
    ///
    /// `events` must be the receiving end of the channel `transport` reports
    /// on.
    pub fn spawn<T>(
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        publisher: Arc<ReadingPublisher>,
        authorization: Arc<dyn Authorization>,
        config: ConnectionConfig,
    ) -> Self
    where
        T: GattTransport + 'static,
    {
        let (commands, command_rx) = mpsc::channel(32);
        let machine =
            ConnectionStateMachine::new(transport, publisher.clone(), authorization, config);
        let task = tokio::spawn(run(machine, command_rx, events));

        Self {
            commands,
            publisher,
            callback_counter: AtomicU64::new(0),
            task: Mutex::new(Some(task)),
        }
    }

    /// Connect to a sensor.
    ///
    /// Returns once the request is issued; progress is reported through the
    /// state stream.
    pub async fn connect(&self, device: Device) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { device, reply }).await?;
        rx.await.map_err(|_| Self::stopped())?
    }

    /// Disconnect and release the session. A no-op when disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply }).await?;
        rx.await.map_err(|_| Self::stopped())
    }

    /// Request an explicit read of a channel.
    pub async fn read_channel(&self, channel: MeasurementChannel) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Read { channel, reply }).await?;
        rx.await.map_err(|_| Self::stopped())?
    }

    /// Release the session and stop the task.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.publisher.state()
    }

    /// Check if the session is ready.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// The publisher this session reports to.
    pub fn publisher(&self) -> &Arc<ReadingPublisher> {
        &self.publisher
    }

    /// Register a callback for decoded readings.
    pub fn on_reading<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&Reading) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.publisher.subscribe_readings();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(reading) => callback(&reading),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Reading callback lagged, skipped {} readings", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for connection state transitions.
    pub fn on_state_change<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.publisher.subscribe_transitions();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(state) => callback(state),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("State callback lagged, skipped {} transitions", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Self::stopped())
    }

    fn stopped() -> Error {
        Error::Internal("sensor task stopped".to_string())
    }
}

impl Drop for SensorConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SensorConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorConnection")
            .field("state", &self.state())
            .finish()
    }
}

async fn run<T: GattTransport>(
    mut machine: ConnectionStateMachine<T>,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    debug!("Sensor task started");

    loop {
        let deadline = machine.next_deadline();

        // Transport outcomes are applied before the next command.
        tokio::select! {
            biased;

            Some(event) = events.recv() => {
                machine.handle_event(event, Instant::now());
            }
            _ = wait_for(deadline) => {
                machine.on_deadline(Instant::now());
            }
            command = commands.recv() => match command {
                Some(Command::Connect { device, reply }) => {
                    let _ = reply.send(machine.connect(device));
                }
                Some(Command::Disconnect { reply }) => {
                    machine.disconnect();
                    let _ = reply.send(());
                }
                Some(Command::Read { channel, reply }) => {
                    let _ = reply.send(machine.read_channel(channel));
                }
                Some(Command::Shutdown { reply }) => {
                    info!("Shutting down sensor connection");
                    machine.close_connection();
                    let _ = reply.send(());
                    break;
                }
                None => {
                    machine.close_connection();
                    break;
                }
            },
        }
    }

    debug!("Sensor task ended");
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
