//! One participant: relay messages and capability events in, user-visible events out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parley_proto::{
    ClientMessage, ConnectionId, Envelope, ErrorCode, FileMetadata, IceCandidate,
    MetadataEnvelope, ServerMessage, SessionDescription,
};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::capability::{
    ChannelPayload, Generation, PeerConnectionFactory, PeerEvent, PeerEvents, ScreenCapture,
};
use crate::config::PeerConfig;
use crate::error::{SessionError, TransferError};
use crate::media::{LocalTracks, MediaTrack};
use crate::session::{NegotiationSession, SessionNotice};
use crate::signaling::{SignalingClient, SignalingError, SignalingSink};
use crate::transfer::{
    AnnounceOutcome, ChunkOutcome, FileReceiver, FileSender, ReceivedFile, SendOutcome,
};

#[derive(Debug)]
pub enum EndpointEvent {
    Registered { id: ConnectionId },
    UsernameAccepted { username: String },
    /// Everyone else the relay knows about.
    Roster { peers: Vec<String> },
    CallConnected { peer: String },
    CallEnded { peer: Option<String> },
    RemoteTrack(Arc<MediaTrack>),
    ChannelOpened { label: String },
    Chat { from: String, text: String },
    FileAnnounced(FileMetadata),
    FileProgress { name: String, received: u64, size: u64 },
    FileReceived(ReceivedFile),
    TransferFailed(TransferError),
    ScreenShareEnded,
    RelayError { code: ErrorCode, message: String },
    RelayClosed,
}

/// A file being streamed by a background task.
pub struct OutgoingFile {
    metadata: FileMetadata,
    offset: Arc<AtomicU64>,
    task: JoinHandle<Result<SendOutcome, TransferError>>,
}

impl OutgoingFile {
    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn offset_sent(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn finish(self) -> Result<SendOutcome, TransferError> {
        self.task
            .await
            .map_err(|err| TransferError::Task(err.to_string()))?
    }
}

pub struct Endpoint {
    config: PeerConfig,
    session: NegotiationSession,
    peer_events: PeerEvents,
    signaling: Arc<dyn SignalingSink>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    relay_closed: bool,
    receiver: FileReceiver,
    /// Name and task of the file currently being sent; one at a time per channel.
    sending: Option<(String, AbortHandle)>,
    id: Option<ConnectionId>,
    username: Option<String>,
    roster: Vec<String>,
    events: mpsc::UnboundedSender<EndpointEvent>,
}

impl Endpoint {
    pub fn new(
        config: PeerConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SignalingSink>,
        inbound: mpsc::UnboundedReceiver<ServerMessage>,
        local_tracks: LocalTracks,
    ) -> (Self, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (session, peer_events) =
            NegotiationSession::new(config.clone(), factory, signaling.clone(), local_tracks);
        let (events, events_rx) = mpsc::unbounded_channel();
        let endpoint = Self {
            config,
            session,
            peer_events,
            signaling,
            inbound,
            relay_closed: false,
            receiver: FileReceiver::new(),
            sending: None,
            id: None,
            username: None,
            roster: Vec::new(),
            events,
        };
        (endpoint, events_rx)
    }

    /// Open a relay connection and build an endpoint on top of it.
    pub async fn connect(
        url: &str,
        config: PeerConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        local_tracks: LocalTracks,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EndpointEvent>), SignalingError> {
        let client = SignalingClient::connect(url).await?;
        let (outbound, inbound) = client.into_parts();
        Ok(Self::new(
            config,
            factory,
            Arc::new(outbound),
            inbound,
            local_tracks,
        ))
    }

    pub fn with_screen_capture(mut self, source: Arc<dyn ScreenCapture>) -> Self {
        self.session = self.session.with_screen_capture(source);
        self
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// How the relay lists this endpoint: its name once accepted, its id before that.
    pub fn display_name(&self) -> Option<String> {
        self.username
            .clone()
            .or_else(|| self.id.map(|id| id.to_string()))
    }

    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    pub fn session(&self) -> &NegotiationSession {
        &self.session
    }

    pub fn receiver(&self) -> &FileReceiver {
        &self.receiver
    }

    pub fn set_username(&self, username: &str) -> Result<(), SessionError> {
        self.signaling.send(ClientMessage::set_username(username))?;
        Ok(())
    }

    pub async fn call(&mut self, peer: &str) -> Result<(), SessionError> {
        self.receiver.reset();
        self.session.initiate_call(peer).await
    }

    pub async fn hang_up(&mut self) {
        let peer = self.session.remote_peer().map(str::to_string);
        self.session.close().await;
        self.receiver.reset();
        self.emit(EndpointEvent::CallEnded { peer });
    }

    pub async fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        self.session.send_text(text).await
    }

    pub fn toggle_camera(&self) -> Result<bool, SessionError> {
        self.session.toggle_camera()
    }

    pub fn toggle_microphone(&self) -> Result<bool, SessionError> {
        self.session.toggle_microphone()
    }

    pub async fn toggle_screen_share(&mut self) -> Result<bool, SessionError> {
        self.session.toggle_screen_share().await
    }

    /// Announce `metadata` to the current peer and stream `reader` over the file channel in
    /// the background. Refused while an earlier file is still going out.
    pub fn send_file<R>(
        &mut self,
        metadata: FileMetadata,
        reader: R,
    ) -> Result<OutgoingFile, TransferError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if let Some((name, task)) = &self.sending {
            if !task.is_finished() {
                warn!(busy = %name, next = %metadata.name, "file send already in progress");
                return Err(TransferError::SendInProgress(name.clone()));
            }
        }

        let peer = self
            .session
            .remote_peer()
            .ok_or(TransferError::ChannelNotOpen)?;
        let channel = self
            .session
            .file_channel()
            .filter(|channel| channel.is_open())
            .cloned()
            .ok_or(TransferError::ChannelNotOpen)?;

        self.signaling
            .send(ClientMessage::metadata(peer, metadata.clone()))?;
        info!(peer, name = %metadata.name, size = metadata.size, "sending file");

        let sender = FileSender::new(channel, self.config.chunk_size, metadata.size);
        let offset = sender.offset_handle();
        let task = sender.spawn(reader);
        self.sending = Some((metadata.name.clone(), task.abort_handle()));
        Ok(OutgoingFile {
            metadata,
            offset,
            task,
        })
    }

    /// Wait for the next relay message or capability event and handle it. Relay messages go
    /// first when both are ready.
    pub async fn step(&mut self) {
        tokio::select! {
            biased;
            message = self.inbound.recv(), if !self.relay_closed => match message {
                Some(message) => self.handle_server_message(message).await,
                None => self.mark_relay_closed(),
            },
            Some((generation, event)) = self.peer_events.recv() => {
                self.handle_peer_event(generation, event).await
            }
        }
    }

    /// Handle everything already queued without waiting. Returns how many inputs were handled.
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if !self.relay_closed {
                match self.inbound.try_recv() {
                    Ok(message) => {
                        self.handle_server_message(message).await;
                        handled += 1;
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => self.mark_relay_closed(),
                    Err(TryRecvError::Empty) => {}
                }
            }
            match self.peer_events.try_recv() {
                Ok((generation, event)) => {
                    self.handle_peer_event(generation, event).await;
                    handled += 1;
                }
                Err(_) => return handled,
            }
        }
    }

    /// Run until the relay is gone and no call is left.
    pub async fn run(mut self) {
        while !self.relay_closed || self.session.has_connection() {
            self.step().await;
        }
        debug!("endpoint stopped");
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Id { id } => {
                info!(id, "registered with relay");
                self.id = Some(id);
                self.emit(EndpointEvent::Registered { id });
            }
            ServerMessage::UsernameAccepted { username } => {
                info!(%username, "username accepted");
                self.username = Some(username.clone());
                self.emit(EndpointEvent::UsernameAccepted { username });
            }
            ServerMessage::UserList { users } => {
                let me = self.display_name();
                self.roster = users
                    .into_iter()
                    .filter(|user| Some(user) != me.as_ref())
                    .collect();
                self.emit(EndpointEvent::Roster {
                    peers: self.roster.clone(),
                });
            }
            ServerMessage::Offer(envelope) => self.on_offer(envelope).await,
            ServerMessage::Answer(envelope) => self.on_answer(envelope).await,
            ServerMessage::NewIceCandidate(envelope) => self.on_candidate(envelope).await,
            ServerMessage::Metadata(envelope) => self.on_metadata(envelope),
            ServerMessage::Error {
                code,
                message,
                target,
            } => {
                warn!(?code, ?target, %message, "relay rejected a message");
                self.emit(EndpointEvent::RelayError { code, message });
            }
        }
    }

    async fn on_offer(&mut self, envelope: Envelope) {
        let Some((from, offer)) = sender_and_payload::<SessionDescription>(&envelope) else {
            warn!("dropping offer without sender or description");
            return;
        };
        match self.session.accept_call(&from, offer).await {
            Ok(()) => {
                self.receiver.reset();
                self.emit(EndpointEvent::CallConnected { peer: from });
            }
            Err(err) => debug!(peer = %from, error = %err, "offer not accepted"),
        }
    }

    async fn on_answer(&mut self, envelope: Envelope) {
        let Some((from, answer)) = sender_and_payload::<SessionDescription>(&envelope) else {
            warn!("dropping answer without sender or description");
            return;
        };
        match self.session.receive_answer(&from, answer).await {
            Ok(()) => self.emit(EndpointEvent::CallConnected { peer: from }),
            Err(err) => debug!(peer = %from, error = %err, "answer not applied"),
        }
    }

    async fn on_candidate(&mut self, envelope: Envelope) {
        let Some((from, candidate)) = sender_and_payload::<IceCandidate>(&envelope) else {
            debug!("skipping empty candidate");
            return;
        };
        if let Err(err) = self.session.receive_ice_candidate(&from, candidate).await {
            debug!(peer = %from, error = %err, "candidate not applied");
        }
    }

    fn on_metadata(&mut self, envelope: MetadataEnvelope) {
        let Some(metadata) = envelope.metadata else {
            warn!("dropping metadata envelope without metadata");
            return;
        };
        self.emit(EndpointEvent::FileAnnounced(metadata.clone()));
        match self.receiver.announce(metadata) {
            AnnounceOutcome::Queued => {}
            AnnounceOutcome::Complete(file) => self.emit(EndpointEvent::FileReceived(file)),
            AnnounceOutcome::Superseded(err) => self.emit(EndpointEvent::TransferFailed(err)),
        }
    }

    async fn handle_peer_event(&mut self, generation: Generation, event: PeerEvent) {
        let peer = self.session.remote_peer().map(str::to_string);
        match self.session.handle_event(generation, event).await {
            Ok(Some(notice)) => self.on_notice(notice, peer),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to handle peer event"),
        }
    }

    fn on_notice(&mut self, notice: SessionNotice, peer: Option<String>) {
        match notice {
            SessionNotice::RemoteTrack(track) => self.emit(EndpointEvent::RemoteTrack(track)),
            SessionNotice::ChannelOpened(label) => {
                self.emit(EndpointEvent::ChannelOpened { label })
            }
            SessionNotice::ChannelMessage { label, payload } => {
                if label == self.config.message_label {
                    let text = match payload {
                        ChannelPayload::Text(text) => text,
                        ChannelPayload::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    };
                    self.emit(EndpointEvent::Chat {
                        from: peer.unwrap_or_default(),
                        text,
                    });
                } else if label == self.config.file_label {
                    self.on_chunk(payload);
                } else {
                    debug!(label, "message on unknown channel");
                }
            }
            SessionNotice::ScreenShareEnded => self.emit(EndpointEvent::ScreenShareEnded),
            SessionNotice::Closed => {
                self.receiver.reset();
                self.emit(EndpointEvent::CallEnded { peer });
            }
        }
    }

    fn on_chunk(&mut self, payload: ChannelPayload) {
        match self.receiver.receive_chunk(payload.into_bytes()) {
            Ok(ChunkOutcome::Progress {
                name,
                received,
                size,
            }) => self.emit(EndpointEvent::FileProgress {
                name,
                received,
                size,
            }),
            Ok(ChunkOutcome::Complete(file)) => self.emit(EndpointEvent::FileReceived(file)),
            Err(err) => self.emit(EndpointEvent::TransferFailed(err)),
        }
    }

    fn mark_relay_closed(&mut self) {
        warn!("relay connection closed");
        self.relay_closed = true;
        self.emit(EndpointEvent::RelayClosed);
    }

    fn emit(&self, event: EndpointEvent) {
        let _ = self.events.send(event);
    }
}

fn sender_and_payload<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Option<(String, T)> {
    let from = envelope.from.clone()?;
    let payload = envelope.payload_as::<T>()?;
    Some((from, payload))
}
