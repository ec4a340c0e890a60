//! Supervision of the background tasks of one live session.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use quickport_core::config::{LivenessSettings, TransferSettings};

use crate::dispatch::Dispatcher;
use crate::event::SessionEvent;
use crate::liveness::{heartbeat_loop, watchdog_loop};
use crate::session::{Handle, SelfConfig};

/// How long a task gets to stop on its own before it is aborted.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Runs the dispatcher, heartbeat and watchdog for a [`Handle`].
pub struct SessionRuntime {
    handle: Handle,
    transfer: TransferSettings,
    liveness: LivenessSettings,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionRuntime {
    /// Start the background tasks. Events arrive on the returned receiver.
    pub fn start(
        handle: Handle,
        transfer: TransferSettings,
        liveness: LivenessSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self::spawn(handle, transfer, liveness, events), rx)
    }

    fn spawn(
        handle: Handle,
        transfer: TransferSettings,
        liveness: LivenessSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);

        let dispatcher = {
            let dispatcher = Dispatcher::new(handle.clone(), transfer.clone(), events.clone());
            let stop = shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.run(stop).await {
                    tracing::error!(error = %e, "dispatcher exited");
                }
            })
        };
        let heartbeat = tokio::spawn(heartbeat_loop(
            handle.clone(),
            liveness.heartbeat_interval(),
            shutdown.subscribe(),
        ));
        let watchdog = tokio::spawn(watchdog_loop(
            Arc::clone(&handle.liveness),
            liveness.watchdog_tick(),
            events.clone(),
            shutdown.subscribe(),
        ));

        Self {
            handle,
            transfer,
            liveness,
            events,
            shutdown,
            tasks: vec![dispatcher, heartbeat, watchdog],
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn transfer_settings(&self) -> &TransferSettings {
        &self.transfer
    }

    /// Stop everything, rebind both sockets on the same local addresses
    /// and start again with the same peer. The event stream carries over.
    ///
    /// No clone of the current [`Handle`] may be held elsewhere.
    pub async fn reset(self) -> anyhow::Result<Self> {
        let Self {
            handle,
            transfer,
            liveness,
            events,
            shutdown,
            tasks,
        } = self;

        stop_tasks(&shutdown, tasks).await;

        let peer = (*handle.peer).clone();
        let (name, primary, secondary) = (
            handle.local.name.clone(),
            handle.local.primary_addr,
            handle.local.secondary_addr,
        );
        drop(handle);

        let local = SelfConfig::bind_at(name, primary, secondary)
            .await
            .context("rebinding session sockets")?;
        tracing::info!(%primary, %secondary, peer = %peer.name, "session reset");

        let handle = Handle::new(local, peer, liveness.ping_timeout());
        Ok(Self::spawn(handle, transfer, liveness, events))
    }

    pub async fn shutdown(self) {
        stop_tasks(&self.shutdown, self.tasks).await;
        tracing::info!("session stopped");
    }
}

async fn stop_tasks(shutdown: &broadcast::Sender<()>, tasks: Vec<JoinHandle<()>>) {
    let _ = shutdown.send(());
    for mut task in tasks {
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            task.abort();
            let _ = task.await;
        }
    }
}
