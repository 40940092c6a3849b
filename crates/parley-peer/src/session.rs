//! Negotiation state machine for one call at a time.
//!
//! A [`NegotiationSession`] owns at most one peer-connection capability. It sequences
//! offer/answer/candidate exchange over the signaling sink, keeps the local track map, swaps
//! the camera for the screen while sharing, and folds capability events back into its state.
//! Capability events are tagged with a generation; anything from a torn-down capability is
//! ignored. Events are only handled between operations, so a local candidate gathered while
//! the offer or answer is being built is sent after that description has gone out.

use std::fmt;
use std::sync::Arc;

use parley_proto::{ClientMessage, IceCandidate, SessionDescription, SignalKind};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capability::{
    ChannelPayload, DataChannel, Generation, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, PeerEvents, ScreenCapture,
};
use crate::config::PeerConfig;
use crate::error::SessionError;
use crate::media::{LocalTracks, MediaTrack, TrackKind, TrackSwap};
use crate::signaling::SignalingSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Closed,
}

impl SignalingState {
    /// States in which an incoming offer may start a new call.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            SignalingState::Idle | SignalingState::Connected | SignalingState::Closed
        )
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Idle => "idle",
            SignalingState::Offering => "offering",
            SignalingState::AwaitingAnswer => "awaiting answer",
            SignalingState::Answering => "answering",
            SignalingState::Connected => "connected",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What a capability event meant for the layer above.
#[derive(Debug)]
pub enum SessionNotice {
    RemoteTrack(Arc<MediaTrack>),
    ChannelOpened(String),
    ChannelMessage {
        label: String,
        payload: ChannelPayload,
    },
    ScreenShareEnded,
    /// The connection dropped and the session has closed.
    Closed,
}

pub struct NegotiationSession {
    config: PeerConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    signaling: Arc<dyn SignalingSink>,
    screen_source: Option<Arc<dyn ScreenCapture>>,
    event_tx: mpsc::UnboundedSender<(Generation, PeerEvent)>,
    generation: Generation,
    sink: Option<PeerEventSink>,
    state: SignalingState,
    remote_peer: Option<String>,
    connection: Option<Arc<dyn PeerConnection>>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_remote_candidates: Vec<IceCandidate>,
    message_channel: Option<Arc<dyn DataChannel>>,
    file_channel: Option<Arc<dyn DataChannel>>,
    local_tracks: LocalTracks,
    remote_tracks: Vec<Arc<MediaTrack>>,
    track_swap: Option<TrackSwap>,
}

impl NegotiationSession {
    /// Build an idle session. Capability events for it arrive on the returned receiver and are
    /// fed back through [`NegotiationSession::handle_event`].
    pub fn new(
        config: PeerConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SignalingSink>,
        local_tracks: LocalTracks,
    ) -> (Self, PeerEvents) {
        let (event_tx, events) = mpsc::unbounded_channel();
        let session = Self {
            config,
            factory,
            signaling,
            screen_source: None,
            event_tx,
            generation: 0,
            sink: None,
            state: SignalingState::Idle,
            remote_peer: None,
            connection: None,
            local_description: None,
            remote_description: None,
            pending_remote_candidates: Vec::new(),
            message_channel: None,
            file_channel: None,
            local_tracks,
            remote_tracks: Vec::new(),
            track_swap: None,
        };
        (session, events)
    }

    pub fn with_screen_capture(mut self, source: Arc<dyn ScreenCapture>) -> Self {
        self.screen_source = Some(source);
        self
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.remote_peer.as_deref()
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn local_tracks(&self) -> &LocalTracks {
        &self.local_tracks
    }

    pub fn remote_tracks(&self) -> &[Arc<MediaTrack>] {
        &self.remote_tracks
    }

    pub fn message_channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.message_channel.as_ref()
    }

    pub fn file_channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.file_channel.as_ref()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.track_swap.is_some()
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Call `target`: fresh capability, local tracks, both data channels, then an offer.
    pub async fn initiate_call(&mut self, target: &str) -> Result<(), SessionError> {
        self.teardown().await;
        self.remote_peer = Some(target.to_string());
        info!(peer = target, "starting call");

        let result = self.offer(target).await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn offer(&mut self, target: &str) -> Result<(), SessionError> {
        let connection = self.acquire().await?;
        self.state = SignalingState::Offering;

        let message = connection
            .create_data_channel(&self.config.message_label)
            .await?;
        let file = connection.create_data_channel(&self.config.file_label).await?;
        self.message_channel = Some(message);
        self.file_channel = Some(file);

        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        self.send_signal(SignalKind::Offer, target, &offer)?;
        self.local_description = Some(offer);

        self.state = SignalingState::AwaitingAnswer;
        Ok(())
    }

    /// Answer an offer from `from`. Only a stable session may answer; anywhere else the offer
    /// is dropped and nothing changes.
    pub async fn accept_call(
        &mut self,
        from: &str,
        offer: SessionDescription,
    ) -> Result<(), SessionError> {
        if !self.state.is_stable() {
            warn!(peer = from, state = %self.state, "ignoring offer during negotiation");
            return Err(SessionError::InvalidSignalingState {
                operation: "accept an offer",
                state: self.state,
            });
        }

        self.teardown().await;
        self.remote_peer = Some(from.to_string());
        info!(peer = from, "answering call");

        let result = self.answer(from, offer).await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn answer(&mut self, from: &str, offer: SessionDescription) -> Result<(), SessionError> {
        let connection = self.acquire().await?;
        self.state = SignalingState::Answering;

        connection.set_remote_description(offer.clone()).await?;
        self.remote_description = Some(offer);
        self.flush_remote_candidates(&connection).await?;

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        self.send_signal(SignalKind::Answer, from, &answer)?;
        self.local_description = Some(answer);

        self.state = SignalingState::Connected;
        Ok(())
    }

    pub async fn receive_answer(
        &mut self,
        from: &str,
        answer: SessionDescription,
    ) -> Result<(), SessionError> {
        if self.state != SignalingState::AwaitingAnswer {
            warn!(peer = from, state = %self.state, "ignoring unexpected answer");
            return Err(SessionError::InvalidSignalingState {
                operation: "apply an answer",
                state: self.state,
            });
        }
        self.ensure_current_peer(SignalKind::Answer, from)?;
        let connection = self.connection.clone().ok_or(SessionError::NoActiveSession)?;

        connection.set_remote_description(answer.clone()).await?;
        self.remote_description = Some(answer);
        self.flush_remote_candidates(&connection).await?;
        self.state = SignalingState::Connected;
        info!(peer = from, "negotiation complete");
        Ok(())
    }

    /// Apply a remote candidate, or hold it until the remote description is in place.
    pub async fn receive_ice_candidate(
        &mut self,
        from: &str,
        candidate: IceCandidate,
    ) -> Result<(), SessionError> {
        let Some(connection) = self.connection.clone() else {
            warn!(peer = from, "candidate arrived with no call in progress");
            return Err(SessionError::NoActiveSession);
        };
        self.ensure_current_peer(SignalKind::NewIceCandidate, from)?;

        if self.remote_description.is_none() {
            debug!(peer = from, "queueing remote candidate");
            self.pending_remote_candidates.push(candidate);
            return Ok(());
        }
        connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub fn toggle_camera(&self) -> Result<bool, SessionError> {
        self.local_tracks.toggle(TrackKind::Video)
    }

    pub fn toggle_microphone(&self) -> Result<bool, SessionError> {
        self.local_tracks.toggle(TrackKind::Audio)
    }

    /// Start sharing when not sharing, stop otherwise. Returns whether sharing is on.
    pub async fn toggle_screen_share(&mut self) -> Result<bool, SessionError> {
        if self.is_screen_sharing() {
            self.stop_screen_share().await?;
            Ok(false)
        } else {
            self.start_screen_share().await?;
            Ok(true)
        }
    }

    pub async fn start_screen_share(&mut self) -> Result<(), SessionError> {
        if self.is_screen_sharing() {
            return Ok(());
        }
        let connection = self.connection.clone().ok_or(SessionError::NoActiveSession)?;
        let source = self
            .screen_source
            .clone()
            .ok_or(SessionError::NoScreenSource)?;
        let original = self
            .local_tracks
            .video
            .clone()
            .ok_or(SessionError::NoLocalTrack(TrackKind::Video))?;

        let screen = source.capture().await?;
        if let Err(err) = connection
            .replace_track(TrackKind::Video, screen.clone())
            .await
        {
            screen.stop();
            return Err(err.into());
        }

        self.local_tracks.set(screen.clone());
        self.track_swap = Some(TrackSwap {
            original,
            screen: screen.clone(),
        });
        self.arm_track_end_hook(screen);
        info!("screen sharing started");
        Ok(())
    }

    /// Put the camera back. A no-op when not sharing.
    pub async fn stop_screen_share(&mut self) -> Result<(), SessionError> {
        let Some(swap) = self.track_swap.take() else {
            return Ok(());
        };
        swap.screen.stop();
        self.local_tracks.set(swap.original.clone());
        if let Some(connection) = self.connection.clone() {
            connection
                .replace_track(TrackKind::Video, swap.original)
                .await?;
        }
        info!("screen sharing stopped");
        Ok(())
    }

    /// Send a chat line over the message channel.
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let channel = self
            .message_channel
            .as_ref()
            .filter(|channel| channel.is_open())
            .ok_or_else(|| SessionError::ChannelNotOpen(self.config.message_label.clone()))?;
        channel.send(ChannelPayload::Text(text.to_string())).await?;
        Ok(())
    }

    /// Hang up. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.state != SignalingState::Closed || self.connection.is_some() {
            info!(peer = ?self.remote_peer, "closing session");
        }
        self.teardown().await;
        self.state = SignalingState::Closed;
    }

    /// Fold one capability event into the session.
    pub async fn handle_event(
        &mut self,
        generation: Generation,
        event: PeerEvent,
    ) -> Result<Option<SessionNotice>, SessionError> {
        if generation != self.generation || self.connection.is_none() {
            debug!(generation, current = self.generation, ?event, "dropping stale peer event");
            return Ok(None);
        }

        match event {
            PeerEvent::IceCandidate(Some(candidate))
                if !candidate.candidate.trim().is_empty() =>
            {
                if let Some(peer) = self.remote_peer.clone() {
                    self.send_signal(SignalKind::NewIceCandidate, &peer, &candidate)?;
                }
                Ok(None)
            }
            PeerEvent::IceCandidate(_) => {
                debug!("local candidate gathering complete");
                Ok(None)
            }
            PeerEvent::Track(track) => {
                debug!(track = track.id(), kind = %track.kind(), "remote track");
                self.remote_tracks.push(track.clone());
                Ok(Some(SessionNotice::RemoteTrack(track)))
            }
            PeerEvent::ConnectionState(state) if state.is_terminal() => {
                warn!(?state, peer = ?self.remote_peer, "peer connection ended");
                self.close().await;
                Ok(Some(SessionNotice::Closed))
            }
            PeerEvent::ConnectionState(state) => {
                debug!(?state, "peer connection state");
                Ok(None)
            }
            PeerEvent::DataChannel(channel) => {
                let label = channel.label().to_string();
                if label == self.config.message_label {
                    self.message_channel = Some(channel);
                } else if label == self.config.file_label {
                    self.file_channel = Some(channel);
                } else {
                    warn!(label, "ignoring unknown data channel");
                    return Ok(None);
                }
                Ok(Some(SessionNotice::ChannelOpened(label)))
            }
            PeerEvent::ChannelMessage { label, payload } => {
                Ok(Some(SessionNotice::ChannelMessage { label, payload }))
            }
            PeerEvent::LocalTrackEnded { track_id } => {
                let sharing = self
                    .track_swap
                    .as_ref()
                    .is_some_and(|swap| swap.screen.id() == track_id);
                if !sharing {
                    return Ok(None);
                }
                self.stop_screen_share().await?;
                Ok(Some(SessionNotice::ScreenShareEnded))
            }
        }
    }

    async fn acquire(&mut self) -> Result<Arc<dyn PeerConnection>, SessionError> {
        let sink = PeerEventSink::new(self.generation, self.event_tx.clone());
        let connection = self.factory.create(sink.clone()).await?;
        self.sink = Some(sink);
        self.connection = Some(connection.clone());

        for track in self.local_tracks.iter() {
            connection.add_track(track.clone()).await?;
        }
        Ok(connection)
    }

    async fn teardown(&mut self) {
        if let Some(swap) = self.track_swap.take() {
            swap.screen.stop();
            self.local_tracks.set(swap.original);
        }
        for channel in [self.message_channel.take(), self.file_channel.take()]
            .into_iter()
            .flatten()
        {
            channel.close().await;
        }
        for track in self.remote_tracks.drain(..) {
            track.stop();
        }
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }

        self.generation += 1;
        self.sink = None;
        self.remote_peer = None;
        self.local_description = None;
        self.remote_description = None;
        self.pending_remote_candidates.clear();
        self.state = SignalingState::Idle;
    }

    fn arm_track_end_hook(&self, track: Arc<MediaTrack>) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        tokio::spawn(async move {
            track.ended().await;
            sink.emit(PeerEvent::LocalTrackEnded {
                track_id: track.id().to_string(),
            });
        });
    }

    fn ensure_current_peer(&self, kind: SignalKind, from: &str) -> Result<(), SessionError> {
        if self.remote_peer.as_deref() == Some(from) {
            return Ok(());
        }
        warn!(%kind, from, current = ?self.remote_peer, "ignoring signal from another peer");
        Err(SessionError::UnexpectedPeer {
            kind,
            from: from.to_string(),
        })
    }

    async fn flush_remote_candidates(
        &mut self,
        connection: &Arc<dyn PeerConnection>,
    ) -> Result<(), SessionError> {
        for candidate in std::mem::take(&mut self.pending_remote_candidates) {
            connection.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    fn send_signal<T: Serialize>(
        &self,
        kind: SignalKind,
        to: &str,
        payload: &T,
    ) -> Result<(), SessionError> {
        let payload =
            serde_json::to_value(payload).map_err(|err| SessionError::InvalidPayload {
                kind,
                reason: err.to_string(),
            })?;
        self.signaling
            .send(ClientMessage::signal(kind, to, payload))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockConnectionFactory, MockScreenCapture};
    use parley_proto::{Envelope, SdpKind};

    struct Harness {
        session: NegotiationSession,
        events: PeerEvents,
        factory: MockConnectionFactory,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        screen: Arc<MockScreenCapture>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_tracks(LocalTracks::camera_and_microphone())
        }

        fn with_tracks(tracks: LocalTracks) -> Self {
            let factory = MockConnectionFactory::new();
            let screen = Arc::new(MockScreenCapture::new());
            let (tx, outbound) = mpsc::unbounded_channel();
            let (session, events) = NegotiationSession::new(
                PeerConfig::default(),
                Arc::new(factory.clone()),
                Arc::new(tx),
                tracks,
            );
            Self {
                session: session.with_screen_capture(screen.clone()),
                events,
                factory,
                outbound,
                screen,
            }
        }

        async fn pump(&mut self) -> Vec<SessionNotice> {
            let mut notices = Vec::new();
            while let Ok((generation, event)) = self.events.try_recv() {
                if let Some(notice) = self.session.handle_event(generation, event).await.unwrap() {
                    notices.push(notice);
                }
            }
            notices
        }

        fn sent(&mut self) -> Vec<ClientMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.outbound.try_recv() {
                out.push(message);
            }
            out
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 9 typ host"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    fn envelope_of(message: &ClientMessage) -> &Envelope {
        match message {
            ClientMessage::Offer(envelope)
            | ClientMessage::Answer(envelope)
            | ClientMessage::NewIceCandidate(envelope) => envelope,
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn initiate_sends_offer_then_candidates() {
        let mut h = Harness::new();
        h.session.initiate_call("bob").await.unwrap();
        assert_eq!(h.session.state(), SignalingState::AwaitingAnswer);
        assert_eq!(h.session.remote_peer(), Some("bob"));

        h.pump().await;
        let sent = h.sent();
        assert_eq!(sent.len(), 2, "offer plus one candidate, no end-of-gathering");
        assert_eq!(sent[0].signal_kind(), Some(SignalKind::Offer));
        assert_eq!(sent[1].signal_kind(), Some(SignalKind::NewIceCandidate));
        assert_eq!(envelope_of(&sent[0]).to.as_deref(), Some("bob"));
        let offer: SessionDescription = envelope_of(&sent[0]).payload_as().unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);

        let connection = h.factory.last().unwrap();
        let calls = connection.calls();
        assert_eq!(
            calls.iter().filter(|c| matches!(c, MockCall::AddTrack { .. })).count(),
            2
        );
        assert!(calls.contains(&MockCall::CreateDataChannel("message".into())));
        assert!(calls.contains(&MockCall::CreateDataChannel("file".into())));
        assert!(h.session.message_channel().is_some());
        assert!(h.session.file_channel().is_some());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn candidates_gathered_during_offer_follow_it() {
        let mut h = Harness::new();
        h.session.initiate_call("bob").await.unwrap();

        let connection = h.factory.last().unwrap();
        assert_eq!(connection.generation(), h.session.generation());
        assert_eq!(connection.senders().len(), 2);
        let labels: Vec<String> = connection
            .channels()
            .iter()
            .map(|channel| channel.label().to_string())
            .collect();
        assert_eq!(labels, vec!["message".to_string(), "file".to_string()]);

        // The mock gathers while the local description is being set.
        assert_eq!(
            h.sent().iter().map(ClientMessage::signal_kind).collect::<Vec<_>>(),
            vec![Some(SignalKind::Offer)]
        );
        h.pump().await;
        assert_eq!(
            h.sent().iter().map(ClientMessage::signal_kind).collect::<Vec<_>>(),
            vec![Some(SignalKind::NewIceCandidate)]
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn blank_candidate_is_not_sent() {
        let mut h = Harness::new();
        h.session.initiate_call("bob").await.unwrap();
        h.pump().await;
        h.sent();
        let generation = h.session.generation();

        for blank in ["", "  "] {
            let event = PeerEvent::IceCandidate(Some(IceCandidate {
                candidate: blank.into(),
                ..candidate(1)
            }));
            assert!(h.session.handle_event(generation, event).await.unwrap().is_none());
        }
        h.session
            .handle_event(generation, PeerEvent::IceCandidate(None))
            .await
            .unwrap();
        assert!(h.sent().is_empty());

        h.session
            .handle_event(generation, PeerEvent::IceCandidate(Some(candidate(2))))
            .await
            .unwrap();
        assert_eq!(h.sent().len(), 1);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn offer_during_negotiation_is_dropped() {
        let mut h = Harness::new();
        h.session.initiate_call("bob").await.unwrap();
        h.sent();

        let err = h
            .session
            .accept_call("bob", SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidSignalingState {
                state: SignalingState::AwaitingAnswer,
                ..
            }
        ));
        assert_eq!(h.session.state(), SignalingState::AwaitingAnswer);
        assert_eq!(h.factory.created(), 1);
        assert!(h.sent().is_empty());

        h.session.state = SignalingState::Answering;
        assert!(h
            .session
            .accept_call("carol", SessionDescription::offer("v=0"))
            .await
            .is_err());
        assert_eq!(h.session.state(), SignalingState::Answering);
        assert_eq!(h.session.remote_peer(), Some("bob"));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn accept_answers_and_connects() {
        let mut h = Harness::new();
        h.session
            .accept_call("alice", SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(h.session.state(), SignalingState::Connected);

        h.pump().await;
        let sent = h.sent();
        assert_eq!(sent[0].signal_kind(), Some(SignalKind::Answer));
        assert_eq!(envelope_of(&sent[0]).to.as_deref(), Some("alice"));
        assert_eq!(sent[1].signal_kind(), Some(SignalKind::NewIceCandidate));

        let calls = h.factory.last().unwrap().calls();
        let remote_at = calls
            .iter()
            .position(|c| *c == MockCall::SetRemoteDescription(SdpKind::Offer))
            .unwrap();
        let answer_at = calls.iter().position(|c| *c == MockCall::CreateAnswer).unwrap();
        assert!(remote_at < answer_at);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn answer_outside_awaiting_answer_is_rejected() {
        let mut h = Harness::new();
        let err = h
            .session
            .receive_answer("bob", SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidSignalingState {
                state: SignalingState::Idle,
                ..
            }
        ));

        h.session
            .accept_call("alice", SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert!(h
            .session
            .receive_answer("alice", SessionDescription::answer("v=0"))
            .await
            .is_err());
        assert_eq!(h.session.state(), SignalingState::Connected);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn remote_candidates_queue_until_answer() {
        let mut h = Harness::new();
        h.session.initiate_call("bob").await.unwrap();

        h.session.receive_ice_candidate("bob", candidate(1)).await.unwrap();
        h.session.receive_ice_candidate("bob", candidate(2)).await.unwrap();
        assert_eq!(h.session.pending_remote_candidates(), 2);
        let connection = h.factory.last().unwrap();
        assert!(connection.remote_candidates().is_empty());

        h.session
            .receive_answer("bob", SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(h.session.state(), SignalingState::Connected);
        assert_eq!(h.session.pending_remote_candidates(), 0);
        assert_eq!(
            connection.remote_candidates(),
            vec![candidate(1).candidate, candidate(2).candidate]
        );

        h.session.receive_ice_candidate("bob", candidate(3)).await.unwrap();
        assert_eq!(connection.remote_candidates().len(), 3);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn signals_from_other_peers_are_ignored() {
        let mut h = Harness::new();
        h.session.initiate_call("bob").await.unwrap();

        let err = h
            .session
            .receive_ice_candidate("mallory", candidate(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnexpectedPeer { .. }));
        assert_eq!(h.session.pending_remote_candidates(), 0);

        assert!(h
            .session
            .receive_answer("mallory", SessionDescription::answer("v=0"))
            .await
            .is_err());
        assert_eq!(h.session.state(), SignalingState::AwaitingAnswer);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn candidate_without_call_is_rejected() {
        let mut h = Harness::new();
        assert_eq!(
            h.session.receive_ice_candidate("bob", candidate(1)).await,
            Err(SessionError::NoActiveSession)
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn camera_toggle_twice_restores_flag() {
        let h = Harness::new();
        let camera = h.session.local_tracks().video.clone().unwrap();
        assert!(camera.is_enabled());

        assert!(!h.session.toggle_camera().unwrap());
        assert!(!camera.is_enabled());
        assert!(h.session.toggle_camera().unwrap());
        assert!(camera.is_enabled());

        assert!(!h.session.toggle_microphone().unwrap());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn toggle_without_track_fails() {
        let h = Harness::with_tracks(LocalTracks::default());
        assert_eq!(
            h.session.toggle_microphone(),
            Err(SessionError::NoLocalTrack(TrackKind::Audio))
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn screen_share_swaps_and_restores_camera() {
        let mut h = Harness::new();
        let camera = h.session.local_tracks().video.clone().unwrap();
        h.session.initiate_call("bob").await.unwrap();
        let connection = h.factory.last().unwrap();

        assert!(h.session.toggle_screen_share().await.unwrap());
        let screen = h.screen.captured().pop().unwrap();
        assert!(Arc::ptr_eq(h.session.local_tracks().video.as_ref().unwrap(), &screen));
        assert!(Arc::ptr_eq(&connection.sender(TrackKind::Video).unwrap(), &screen));

        assert!(!h.session.toggle_screen_share().await.unwrap());
        assert!(screen.is_ended());
        assert!(Arc::ptr_eq(h.session.local_tracks().video.as_ref().unwrap(), &camera));
        assert!(Arc::ptr_eq(&connection.sender(TrackKind::Video).unwrap(), &camera));

        let replacements = connection
            .calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::ReplaceTrack { .. }))
            .count();
        h.session.stop_screen_share().await.unwrap();
        let after = connection
            .calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::ReplaceTrack { .. }))
            .count();
        assert_eq!(replacements, 2);
        assert_eq!(after, 2, "stopping twice must not touch the sender again");
        assert!(!h.session.is_screen_sharing());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn screen_share_needs_a_call() {
        let mut h = Harness::new();
        assert_eq!(
            h.session.start_screen_share().await,
            Err(SessionError::NoActiveSession)
        );
        assert!(h.screen.captured().is_empty());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn ended_screen_track_stops_sharing() {
        let mut h = Harness::new();
        let camera = h.session.local_tracks().video.clone().unwrap();
        h.session.initiate_call("bob").await.unwrap();
        h.session.start_screen_share().await.unwrap();
        h.pump().await;

        // The user ends sharing from outside the app.
        let screen = h.screen.captured().pop().unwrap();
        screen.stop();
        let (generation, event) = h.events.recv().await.unwrap();
        let notice = h.session.handle_event(generation, event).await.unwrap();

        assert!(matches!(notice, Some(SessionNotice::ScreenShareEnded)));
        assert!(!h.session.is_screen_sharing());
        assert!(Arc::ptr_eq(h.session.local_tracks().video.as_ref().unwrap(), &camera));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn failed_connection_closes_once() {
        let mut h = Harness::new();
        h.session.initiate_call("bob").await.unwrap();
        h.pump().await;
        let connection = h.factory.last().unwrap();

        connection.fail();
        connection.fail();
        let notices = h.pump().await;
        assert_eq!(
            notices
                .iter()
                .filter(|n| matches!(n, SessionNotice::Closed))
                .count(),
            1
        );
        assert_eq!(h.session.state(), SignalingState::Closed);
        assert!(connection.is_closed());
        assert_eq!(
            connection.calls().iter().filter(|c| **c == MockCall::Close).count(),
            1
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn events_from_old_connection_are_ignored() {
        let mut h = Harness::new();
        h.session.initiate_call("bob").await.unwrap();
        let first = h.factory.last().unwrap();
        h.session.initiate_call("carol").await.unwrap();
        h.pump().await;
        h.sent();

        first.emit(PeerEvent::IceCandidate(Some(candidate(9))));
        first.fail();
        assert!(h.pump().await.is_empty());
        assert_eq!(h.session.state(), SignalingState::AwaitingAnswer);
        assert_eq!(h.session.remote_peer(), Some("carol"));
        assert!(h.sent().is_empty());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn close_is_idempotent_and_restores_camera() {
        let mut h = Harness::new();
        let camera = h.session.local_tracks().video.clone().unwrap();
        h.session.initiate_call("bob").await.unwrap();
        h.session.start_screen_share().await.unwrap();
        let message = h.session.message_channel().cloned().unwrap();

        h.session.close().await;
        h.session.close().await;
        assert_eq!(h.session.state(), SignalingState::Closed);
        assert!(!h.session.has_connection());
        assert!(!message.is_open());
        assert!(!h.session.is_screen_sharing());
        assert!(Arc::ptr_eq(h.session.local_tracks().video.as_ref().unwrap(), &camera));
        assert!(h.session.message_channel().is_none());

        h.session
            .accept_call("carol", SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(h.session.state(), SignalingState::Connected);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn chat_needs_an_open_channel() {
        let mut h = Harness::new();
        assert_eq!(
            h.session.send_text("hi").await,
            Err(SessionError::ChannelNotOpen("message".into()))
        );
        h.session.initiate_call("bob").await.unwrap();
        // Unanswered: the channel exists but is not open yet.
        assert!(h.session.send_text("hi").await.is_err());
    }
}
