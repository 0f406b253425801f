//! Runs a `Controller` on its own task. UI calls become `MeshCmd`s with a oneshot for
//! the reply; transport events are read from the same select loop, so the Controller
//! only ever sees one thing at a time.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::MeshError;
use crate::internal::data_types::{ConnectionState, EdgeInfo, PeerId};
use crate::internal::events::TransportEvent;
use crate::internal::media::{MediaStream, MediaTrack};
use crate::internal::presence::{PeerStatus, RosterEntry};
use crate::Controller;

pub enum MeshCmd {
    CallPeer {
        peer: PeerId,
        local: MediaStream,
        response: oneshot::Sender<Result<EdgeInfo, MeshError>>,
    },
    ConnectData {
        peer: PeerId,
        response: oneshot::Sender<Result<(), MeshError>>,
    },
    RemovePeer {
        peer: PeerId,
        response: oneshot::Sender<()>,
    },
    EndAllCalls {
        response: oneshot::Sender<()>,
    },
    EndCall {
        response: oneshot::Sender<()>,
    },
    ReplaceTrack {
        track: Arc<dyn MediaTrack>,
        response: oneshot::Sender<usize>,
    },
    SendMessage {
        text: String,
        response: oneshot::Sender<usize>,
    },
    SendReaction {
        emoji: String,
        response: oneshot::Sender<usize>,
    },
    BroadcastPresence {
        response: oneshot::Sender<usize>,
    },
    SetStatus {
        status: PeerStatus,
        response: oneshot::Sender<usize>,
    },
    SetLabel {
        label: String,
        response: oneshot::Sender<usize>,
    },
    SetRoomCode {
        code: Option<String>,
        response: oneshot::Sender<Option<String>>,
    },
    CreateRoom {
        response: oneshot::Sender<String>,
    },
    SetVolume {
        peer: PeerId,
        volume: f32,
    },
    ToggleMute {
        peer: PeerId,
        response: oneshot::Sender<bool>,
    },
    ResumePlayback {
        response: oneshot::Sender<usize>,
    },
    Roster {
        response: oneshot::Sender<Vec<RosterEntry>>,
    },
    ConnectionStates {
        response: oneshot::Sender<Vec<(PeerId, ConnectionState)>>,
    },
    /// ends the call and stops the loop
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// drives `controller` until Shutdown is received or every command sender is dropped
pub async fn run(
    mut controller: Controller,
    mut cmd_rx: mpsc::UnboundedReceiver<MeshCmd>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let cmd = match cmd {
                    Some(c) => c,
                    None => break,
                };
                if let MeshCmd::Shutdown { response } = cmd {
                    controller.end_call().await;
                    let _ = response.send(());
                    log::debug!("mesh loop stopped");
                    return;
                }
                handle_cmd(&mut controller, cmd).await;
            }
            evt = transport_rx.recv() => {
                match evt {
                    Some(evt) => controller.handle_transport_event(evt).await,
                    None => break,
                }
            }
        }
    }
    controller.end_call().await;
    log::debug!("mesh loop stopped");
}

// a dropped response channel only means the caller stopped waiting
async fn handle_cmd(controller: &mut Controller, cmd: MeshCmd) {
    match cmd {
        MeshCmd::CallPeer {
            peer,
            local,
            response,
        } => {
            let _ = response.send(controller.call_peer(peer, local).await);
        }
        MeshCmd::ConnectData { peer, response } => {
            let _ = response.send(controller.connect_data(peer));
        }
        MeshCmd::RemovePeer { peer, response } => {
            controller.remove_peer(&peer).await;
            let _ = response.send(());
        }
        MeshCmd::EndAllCalls { response } => {
            controller.end_all_calls().await;
            let _ = response.send(());
        }
        MeshCmd::EndCall { response } => {
            controller.end_call().await;
            let _ = response.send(());
        }
        MeshCmd::ReplaceTrack { track, response } => {
            let _ = response.send(controller.replace_outbound_track(track).await);
        }
        MeshCmd::SendMessage { text, response } => {
            let _ = response.send(controller.send_message(&text));
        }
        MeshCmd::SendReaction { emoji, response } => {
            let _ = response.send(controller.send_reaction(&emoji));
        }
        MeshCmd::BroadcastPresence { response } => {
            let _ = response.send(controller.broadcast_presence());
        }
        MeshCmd::SetStatus { status, response } => {
            let _ = response.send(controller.set_status(status));
        }
        MeshCmd::SetLabel { label, response } => {
            let _ = response.send(controller.set_label(&label));
        }
        MeshCmd::SetRoomCode { code, response } => {
            let _ = response.send(controller.set_room_code(code.as_deref()));
        }
        MeshCmd::CreateRoom { response } => {
            let _ = response.send(controller.create_room());
        }
        MeshCmd::SetVolume { peer, volume } => controller.set_volume(&peer, volume),
        MeshCmd::ToggleMute { peer, response } => {
            let _ = response.send(controller.toggle_mute(&peer));
        }
        MeshCmd::ResumePlayback { response } => {
            let _ = response.send(controller.resume_playback());
        }
        MeshCmd::Roster { response } => {
            let _ = response.send(controller.roster());
        }
        MeshCmd::ConnectionStates { response } => {
            let _ = response.send(controller.connection_states());
        }
        MeshCmd::Shutdown { response } => {
            let _ = response.send(());
        }
    }
}

/// moves `controller` onto a tokio task. `transport_rx` must be the receiving half of the
/// channel the controller and the transport were built with
pub fn spawn(
    controller: Controller,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
) -> MeshHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(controller, rx, transport_rx));
    MeshHandle { tx }
}

/// cheap to clone. every method fails with MeshError::Shutdown once the loop has stopped
#[derive(Clone)]
pub struct MeshHandle {
    tx: mpsc::UnboundedSender<MeshCmd>,
}

impl MeshHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> MeshCmd,
    ) -> Result<T, MeshError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(build(response))
            .map_err(|_| MeshError::Shutdown)?;
        rx.await.map_err(|_| MeshError::Shutdown)
    }

    pub async fn call_peer(&self, peer: PeerId, local: MediaStream) -> Result<EdgeInfo, MeshError> {
        self.request(|response| MeshCmd::CallPeer {
            peer,
            local,
            response,
        })
        .await?
    }

    pub async fn connect_data(&self, peer: PeerId) -> Result<(), MeshError> {
        self.request(|response| MeshCmd::ConnectData { peer, response })
            .await?
    }

    pub async fn remove_peer(&self, peer: PeerId) -> Result<(), MeshError> {
        self.request(|response| MeshCmd::RemovePeer { peer, response })
            .await
    }

    pub async fn end_all_calls(&self) -> Result<(), MeshError> {
        self.request(|response| MeshCmd::EndAllCalls { response })
            .await
    }

    pub async fn end_call(&self) -> Result<(), MeshError> {
        self.request(|response| MeshCmd::EndCall { response }).await
    }

    pub async fn replace_outbound_track(
        &self,
        track: Arc<dyn MediaTrack>,
    ) -> Result<usize, MeshError> {
        self.request(|response| MeshCmd::ReplaceTrack { track, response })
            .await
    }

    pub async fn send_message(&self, text: &str) -> Result<usize, MeshError> {
        let text = text.to_string();
        self.request(|response| MeshCmd::SendMessage { text, response })
            .await
    }

    pub async fn send_reaction(&self, emoji: &str) -> Result<usize, MeshError> {
        let emoji = emoji.to_string();
        self.request(|response| MeshCmd::SendReaction { emoji, response })
            .await
    }

    pub async fn broadcast_presence(&self) -> Result<usize, MeshError> {
        self.request(|response| MeshCmd::BroadcastPresence { response })
            .await
    }

    pub async fn set_status(&self, status: PeerStatus) -> Result<usize, MeshError> {
        self.request(|response| MeshCmd::SetStatus { status, response })
            .await
    }

    pub async fn set_label(&self, label: &str) -> Result<usize, MeshError> {
        let label = label.to_string();
        self.request(|response| MeshCmd::SetLabel { label, response })
            .await
    }

    pub async fn set_room_code(&self, code: Option<String>) -> Result<Option<String>, MeshError> {
        self.request(|response| MeshCmd::SetRoomCode { code, response })
            .await
    }

    pub async fn create_room(&self) -> Result<String, MeshError> {
        self.request(|response| MeshCmd::CreateRoom { response })
            .await
    }

    pub fn set_volume(&self, peer: PeerId, volume: f32) -> Result<(), MeshError> {
        self.tx
            .send(MeshCmd::SetVolume { peer, volume })
            .map_err(|_| MeshError::Shutdown)
    }

    pub async fn toggle_mute(&self, peer: PeerId) -> Result<bool, MeshError> {
        self.request(|response| MeshCmd::ToggleMute { peer, response })
            .await
    }

    pub async fn resume_playback(&self) -> Result<usize, MeshError> {
        self.request(|response| MeshCmd::ResumePlayback { response })
            .await
    }

    pub async fn roster(&self) -> Result<Vec<RosterEntry>, MeshError> {
        self.request(|response| MeshCmd::Roster { response }).await
    }

    pub async fn connection_states(&self) -> Result<Vec<(PeerId, ConnectionState)>, MeshError> {
        self.request(|response| MeshCmd::ConnectionStates { response })
            .await
    }

    pub async fn shutdown(&self) -> Result<(), MeshError> {
        self.request(|response| MeshCmd::Shutdown { response })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::internal::presence::LocalProfile;
    use crate::internal::test_support::{mock_stream, MockAudioOutput, MockSignaling};
    use crate::InitArgs;
    use std::time::Duration;

    fn start() -> (MeshHandle, Arc<MockSignaling>, mpsc::UnboundedReceiver<crate::EmittedEvents>) {
        let signaling = Arc::new(MockSignaling::default());
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let controller = Controller::init(InitArgs {
            id: "me".into(),
            profile: LocalProfile::default(),
            config: MeshConfig {
                connect_timeout_ms: None,
                ..Default::default()
            },
            signaling: signaling.clone(),
            audio_output: Arc::new(MockAudioOutput::default()),
            transport_event_chan: transport_tx,
            emitted_event_chan: event_tx,
        })
        .unwrap();
        (spawn(controller, transport_rx), signaling, event_rx)
    }

    #[tokio::test]
    async fn dial_result_is_fed_back_through_the_loop() {
        let (handle, signaling, _events) = start();
        let (local, _) = mock_stream("local");
        let edge = handle.call_peer("B".into(), local).await.unwrap();
        assert_eq!(edge.state, ConnectionState::Connecting);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(signaling.dials_to("B").len(), 1);
        assert_eq!(
            handle.connection_states().await.unwrap(),
            vec![(PeerId::from("B"), ConnectionState::Connecting)]
        );
    }

    #[tokio::test]
    async fn shutdown_ends_the_call() {
        let (handle, signaling, _events) = start();
        let (local, track) = mock_stream("local");
        handle.call_peer("B".into(), local).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.shutdown().await.unwrap();
        assert!(signaling.dials_to("B")[0].was_closed());
        assert!(track.is_stopped());
        assert!(matches!(handle.roster().await, Err(MeshError::Shutdown)));
    }

    #[tokio::test]
    async fn invalid_peer_error_reaches_the_caller() {
        let (handle, _, _events) = start();
        let (local, _) = mock_stream("local");
        assert!(matches!(
            handle.call_peer("".into(), local).await,
            Err(MeshError::InvalidPeer(_))
        ));
        assert_eq!(handle.roster().await.unwrap().len(), 1);
    }
}
