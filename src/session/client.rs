//! Single-task driver for a `ChannelSessionManager`.
//!
//! The driver task owns the manager. User commands, link events, peer events
//! and speaking ticks are applied strictly one at a time. After every step
//! the presentation snapshot is republished if it changed.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::manager::{ChannelSessionManager, ManagerEvent};
use super::state::VoiceSnapshot;
use crate::error::VoiceError;

enum Command {
    Join(String, oneshot::Sender<Result<(), VoiceError>>),
    Leave,
    SetMuted(bool),
    SetDeafened(bool),
    SetPeerMuted(String, bool),
    Shutdown,
}

/// Handle to a running voice driver
pub struct VoiceClient {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<VoiceSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl VoiceClient {
    /// Move `manager` onto a new driver task. Must be called inside a tokio runtime.
    pub fn spawn(manager: ChannelSessionManager) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(manager.snapshot());
        let task = tokio::spawn(drive(manager, command_rx, snapshot_tx));

        Self {
            commands,
            snapshot,
            task: Some(task),
        }
    }

    /// Join `channel_id`. Resolves once capture was acquired and the link dialed.
    pub async fn join(&self, channel_id: &str) -> Result<(), VoiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Join(channel_id.to_string(), reply_tx))
            .map_err(|_| VoiceError::Transport("voice driver stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| VoiceError::Transport("voice driver stopped".to_string()))?
    }

    pub fn leave(&self) {
        self.command(Command::Leave);
    }

    pub fn set_muted(&self, muted: bool) {
        self.command(Command::SetMuted(muted));
    }

    pub fn set_deafened(&self, deafened: bool) {
        self.command(Command::SetDeafened(deafened));
    }

    pub fn set_peer_muted(&self, remote_id: &str, muted: bool) {
        self.command(Command::SetPeerMuted(remote_id.to_string(), muted));
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> VoiceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<VoiceSnapshot> {
        self.snapshot.clone()
    }

    /// Leave the channel and wait for the driver to exit
    pub async fn shutdown(mut self) {
        self.command(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("[VoiceClient] Driver ended abnormally: {}", e);
            }
        }
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("[VoiceClient] Driver already stopped");
        }
    }
}

enum Step {
    Command(Command),
    Stopped,
    Event(ManagerEvent),
}

async fn drive(
    mut manager: ChannelSessionManager,
    mut commands: mpsc::UnboundedReceiver<Command>,
    snapshot: watch::Sender<VoiceSnapshot>,
) {
    log::debug!("[VoiceClient] Driver started");

    loop {
        let step = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => Step::Command(command),
                None => Step::Stopped,
            },
            event = manager.next_event() => Step::Event(event),
        };

        match step {
            Step::Command(Command::Join(channel_id, reply)) => {
                let result = manager.join(&channel_id).await;
                let _ = reply.send(result);
            }
            Step::Command(Command::Leave) => manager.leave().await,
            Step::Command(Command::SetMuted(muted)) => manager.set_muted(muted),
            Step::Command(Command::SetDeafened(deafened)) => manager.set_deafened(deafened),
            Step::Command(Command::SetPeerMuted(remote_id, muted)) => {
                manager.set_peer_muted(&remote_id, muted);
            }
            Step::Command(Command::Shutdown) | Step::Stopped => {
                manager.leave().await;
                publish(&snapshot, &manager);
                break;
            }
            Step::Event(event) => manager.handle_event(event).await,
        }

        publish(&snapshot, &manager);
    }

    log::debug!("[VoiceClient] Driver stopped");
}

fn publish(snapshot: &watch::Sender<VoiceSnapshot>, manager: &ChannelSessionManager) {
    let next = manager.snapshot();
    snapshot.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::VoiceConfig;
    use crate::identity::LocalIdentity;
    use crate::session::manager::VoiceEnvironment;
    use crate::session::state::ManagerState;
    use crate::signaling::{LinkEvent, SignalingEnvelope};
    use crate::testing::{FakeConnector, FakeDevices, FakeDialer, FakeOutputs};

    fn client(devices: FakeDevices) -> (VoiceClient, Arc<FakeDialer>, Arc<FakeConnector>) {
        let dialer = Arc::new(FakeDialer::default());
        let connector = Arc::new(FakeConnector::default());
        let env = VoiceEnvironment {
            devices: Arc::new(devices),
            connector: connector.clone(),
            dialer: dialer.clone(),
            outputs: Arc::new(FakeOutputs::default()),
        };
        let manager = ChannelSessionManager::new(
            VoiceConfig::default(),
            LocalIdentity::new("user-alice", "Alice"),
            env,
        )
        .unwrap();
        (VoiceClient::spawn(manager), dialer, connector)
    }

    async fn wait_for<F: Fn(&VoiceSnapshot) -> bool>(rx: &mut watch::Receiver<VoiceSnapshot>, pred: F) {
        let matched = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        assert!(matched, "Timed out waiting for snapshot");
    }

    #[tokio::test]
    async fn test_join_publishes_snapshots() {
        let (client, dialer, connector) = client(FakeDevices::granted());
        let mut rx = client.subscribe();

        client.join("general").await.unwrap();
        wait_for(&mut rx, |s| s.state == ManagerState::Connecting).await;

        let link = dialer.last().unwrap();
        link.push(LinkEvent::Opened);
        wait_for(&mut rx, |s| s.state == ManagerState::Joined).await;

        link.push(LinkEvent::Message(SignalingEnvelope::user_joined("b2")));
        wait_for(&mut rx, |s| s.peers.contains_key("b2")).await;
        assert_eq!(connector.connects(), 1);

        client.set_muted(true);
        wait_for(&mut rx, |s| s.local.mic_muted).await;

        client.shutdown().await;
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn test_join_reports_capture_failure() {
        let (client, dialer, _) = client(FakeDevices::denied());
        let mut rx = client.subscribe();

        let err = client.join("general").await.unwrap_err();
        assert!(matches!(err, VoiceError::Capture(_)));
        wait_for(&mut rx, |s| s.state == ManagerState::Acquiring).await;
        assert!(dialer.links().is_empty());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_close_returns_to_idle() {
        let (client, dialer, _) = client(FakeDevices::granted());
        let mut rx = client.subscribe();

        client.join("general").await.unwrap();
        let link = dialer.last().unwrap();
        link.push(LinkEvent::Opened);
        wait_for(&mut rx, |s| s.state == ManagerState::Joined).await;

        link.push(LinkEvent::Closed(Some("server went away".to_string())));
        wait_for(&mut rx, |s| s.state == ManagerState::Idle).await;
        assert!(client.snapshot().channel.is_none());

        client.shutdown().await;
    }
}
