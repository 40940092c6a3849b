//! In-memory peer-connection capability for tests and simulation.
//!
//! Connections created by one [`MockConnectionFactory`] (or its clones) find each other through
//! the SDP they exchange: an offer names the connection that produced it, so when the answering
//! side applies it the two are linked, their data channels are paired and each side sees the
//! other's tracks. Every call is recorded for assertions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_proto::{IceCandidate, SdpKind, SessionDescription};

use crate::capability::{
    ChannelPayload, ConnectionState, DataChannel, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, ScreenCapture,
};
use crate::error::CapabilityError;
use crate::media::{MediaTrack, TrackKind};

// ============================================================================
// Mock Data Channel
// ============================================================================

/// Data channel whose sends land as `ChannelMessage` events on the linked side's sink.
pub struct MockDataChannel {
    label: String,
    open: Arc<AtomicBool>,
    remote: Mutex<Option<PeerEventSink>>,
    sent: Mutex<Vec<ChannelPayload>>,
}

impl MockDataChannel {
    /// A closed, unlinked channel.
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_state(label, Arc::new(AtomicBool::new(false)), None)
    }

    /// An open channel that records sends without delivering them anywhere.
    pub fn open(label: impl Into<String>) -> Self {
        Self::with_state(label, Arc::new(AtomicBool::new(true)), None)
    }

    /// Two open halves sharing one open flag; what `a` sends arrives on `b_events` and the
    /// other way round.
    pub fn pair(
        label: &str,
        a_events: PeerEventSink,
        b_events: PeerEventSink,
    ) -> (Arc<Self>, Arc<Self>) {
        let open = Arc::new(AtomicBool::new(true));
        let a = Self::with_state(label, open.clone(), Some(b_events));
        let b = Self::with_state(label, open, Some(a_events));
        (Arc::new(a), Arc::new(b))
    }

    fn with_state(
        label: impl Into<String>,
        open: Arc<AtomicBool>,
        remote: Option<PeerEventSink>,
    ) -> Self {
        Self {
            label: label.into(),
            open,
            remote: Mutex::new(remote),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Connect this channel to a remote sink and return the remote half, which delivers
    /// to `local_events`. Both halves are open afterwards.
    fn link(&self, local_events: PeerEventSink, remote_events: PeerEventSink) -> Arc<Self> {
        *self.remote.lock() = Some(remote_events);
        let half = Self::with_state(self.label.clone(), self.open.clone(), Some(local_events));
        self.open.store(true, Ordering::SeqCst);
        Arc::new(half)
    }

    /// Everything accepted by `send`, in order.
    pub fn sent(&self) -> Vec<ChannelPayload> {
        self.sent.lock().clone()
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: ChannelPayload) -> Result<(), CapabilityError> {
        if !self.is_open() {
            return Err(CapabilityError::ChannelClosed);
        }
        self.sent.lock().push(payload.clone());
        let remote = self.remote.lock().clone();
        if let Some(remote) = remote {
            remote.emit(PeerEvent::ChannelMessage {
                label: self.label.clone(),
                payload,
            });
        }
        // Give the receiving side a chance to run between chunks.
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Mock Peer Connection
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SdpKind),
    SetRemoteDescription(SdpKind),
    AddTrack { kind: TrackKind, id: String },
    ReplaceTrack { kind: TrackKind, id: String },
    CreateDataChannel(String),
    AddIceCandidate(String),
    Close,
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<Arc<MediaTrack>>,
    channels: Vec<Arc<MockDataChannel>>,
    peer: Option<u64>,
    closed: bool,
}

pub struct MockPeerConnection {
    id: u64,
    events: PeerEventSink,
    network: Weak<Network>,
    state: Mutex<MockState>,
}

impl MockPeerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Generation of the session that created this connection.
    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Tracks currently attached to senders.
    pub fn senders(&self) -> Vec<Arc<MediaTrack>> {
        self.state.lock().senders.clone()
    }

    pub fn sender(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.state
            .lock()
            .senders
            .iter()
            .find(|track| track.kind() == kind)
            .cloned()
    }

    pub fn channels(&self) -> Vec<Arc<MockDataChannel>> {
        self.state.lock().channels.clone()
    }

    pub fn remote_candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Inject an event as if the stack had produced it.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.events.emit(event)
    }

    pub fn fail(&self) -> bool {
        self.emit(PeerEvent::ConnectionState(ConnectionState::Failed))
    }

    fn record(&self, call: MockCall) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.closed {
            return Err(CapabilityError::Closed);
        }
        Ok(())
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.id,
                50_000 + self.id
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("v=0\r\no=mock {} 0 IN IP4 127.0.0.1\r\ns=parley\r\n", self.id),
        }
    }

    fn peer_from(&self, description: &SessionDescription) -> Option<Arc<MockPeerConnection>> {
        let id = mock_origin(&description.sdp)?;
        if id == self.id {
            return None;
        }
        self.network.upgrade()?.find(id)
    }

    // Answering side applied the caller's offer: pair channels and show the caller's tracks.
    fn link_caller(&self, caller: &MockPeerConnection) {
        let (channels, tracks) = {
            let mut state = caller.state.lock();
            state.peer = Some(self.id);
            (state.channels.clone(), state.senders.clone())
        };
        let halves: Vec<Arc<MockDataChannel>> = channels
            .iter()
            .map(|channel| channel.link(caller.events.clone(), self.events.clone()))
            .collect();
        {
            let mut state = self.state.lock();
            state.peer = Some(caller.id);
            state.channels.extend(halves.iter().cloned());
        }

        self.events
            .emit(PeerEvent::ConnectionState(ConnectionState::Connecting));
        for half in halves {
            self.events.emit(PeerEvent::DataChannel(half));
        }
        for track in tracks {
            self.events.emit(PeerEvent::Track(remote_copy(&track)));
        }
    }

    // Calling side applied the answer: show the answerer's tracks and report connected.
    fn complete_with(&self, answerer: &MockPeerConnection) {
        let tracks = answerer.state.lock().senders.clone();
        self.state.lock().peer = Some(answerer.id);
        for track in tracks {
            self.events.emit(PeerEvent::Track(remote_copy(&track)));
        }
        self.events
            .emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        answerer
            .events
            .emit(PeerEvent::ConnectionState(ConnectionState::Connected));
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError> {
        self.record(MockCall::CreateOffer)?;
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError> {
        self.record(MockCall::CreateAnswer)?;
        if self.state.lock().remote.is_none() {
            return Err(CapabilityError::Negotiation(
                "cannot answer without a remote offer".into(),
            ));
        }
        Ok(self.description(SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError> {
        self.record(MockCall::SetLocalDescription(description.kind))?;
        self.state.lock().local = Some(description);
        self.events
            .emit(PeerEvent::IceCandidate(Some(self.local_candidate())));
        self.events.emit(PeerEvent::IceCandidate(None));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError> {
        self.record(MockCall::SetRemoteDescription(description.kind))?;
        let peer = self.peer_from(&description);
        let kind = description.kind;
        self.state.lock().remote = Some(description);
        match (kind, peer) {
            (SdpKind::Offer, Some(caller)) => self.link_caller(&caller),
            (SdpKind::Answer, Some(answerer)) => self.complete_with(&answerer),
            _ => {}
        }
        Ok(())
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), CapabilityError> {
        self.record(MockCall::AddTrack {
            kind: track.kind(),
            id: track.id().to_string(),
        })?;
        self.state.lock().senders.push(track);
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Arc<MediaTrack>,
    ) -> Result<(), CapabilityError> {
        self.record(MockCall::ReplaceTrack {
            kind,
            id: track.id().to_string(),
        })?;
        let mut state = self.state.lock();
        let sender = state
            .senders
            .iter_mut()
            .find(|sender| sender.kind() == kind)
            .ok_or(CapabilityError::NoSender(kind))?;
        *sender = track;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, CapabilityError> {
        self.record(MockCall::CreateDataChannel(label.to_string()))?;
        let channel = Arc::new(MockDataChannel::new(label));
        self.state.lock().channels.push(channel.clone());
        Ok(channel)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CapabilityError> {
        self.record(MockCall::AddIceCandidate(candidate.candidate))?;
        if self.state.lock().remote.is_none() {
            return Err(CapabilityError::Negotiation(
                "candidate added before remote description".into(),
            ));
        }
        Ok(())
    }

    async fn close(&self) {
        let (channels, peer) = {
            let mut state = self.state.lock();
            state.calls.push(MockCall::Close);
            if state.closed {
                return;
            }
            state.closed = true;
            (state.channels.clone(), state.peer)
        };
        for channel in channels {
            channel.set_open(false);
        }
        let remote = peer.and_then(|id| self.network.upgrade()?.find(id));
        if let Some(remote) = remote {
            remote
                .events
                .emit(PeerEvent::ConnectionState(ConnectionState::Disconnected));
        }
    }
}

fn mock_origin(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=mock "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
}

fn remote_copy(track: &MediaTrack) -> Arc<MediaTrack> {
    MediaTrack::with_id(track.id(), track.kind(), track.label())
}

// ============================================================================
// Mock Peer Connection Factory
// ============================================================================

#[derive(Default)]
struct Network {
    next_id: AtomicU64,
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl Network {
    fn find(&self, id: u64) -> Option<Arc<MockPeerConnection>> {
        self.connections
            .lock()
            .iter()
            .find(|connection| connection.id == id)
            .cloned()
    }
}

/// Hands out [`MockPeerConnection`]s. Clones share one network, so endpoints built from
/// clones of the same factory can reach each other.
#[derive(Clone, Default)]
pub struct MockConnectionFactory {
    network: Arc<Network>,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection created so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.network.connections.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockPeerConnection>> {
        self.network.connections.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.network.connections.lock().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockConnectionFactory {
    async fn create(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CapabilityError> {
        let id = self.network.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new(MockPeerConnection {
            id,
            events,
            network: Arc::downgrade(&self.network),
            state: Mutex::new(MockState::default()),
        });
        self.network.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

// ============================================================================
// Mock Screen Capture
// ============================================================================

#[derive(Default)]
pub struct MockScreenCapture {
    deny: AtomicBool,
    captured: Mutex<Vec<Arc<MediaTrack>>>,
}

impl MockScreenCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that refuses every capture, like a dismissed permission prompt.
    pub fn denying() -> Self {
        Self {
            deny: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn captured(&self) -> Vec<Arc<MediaTrack>> {
        self.captured.lock().clone()
    }
}

#[async_trait]
impl ScreenCapture for MockScreenCapture {
    async fn capture(&self) -> Result<Arc<MediaTrack>, CapabilityError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CapabilityError::Capture("permission denied".into()));
        }
        let track = MediaTrack::new(TrackKind::Video, "screen");
        self.captured.lock().push(track.clone());
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::PeerEvents;
    use tokio::sync::mpsc;

    fn sink(generation: u64) -> (PeerEventSink, PeerEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerEventSink::new(generation, tx), rx)
    }

    fn drain(rx: &mut PeerEvents) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        while let Ok((_, event)) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn paired_channels_deliver_to_the_other_side() {
        let (a_sink, mut a_rx) = sink(1);
        let (b_sink, mut b_rx) = sink(2);
        let (a, b) = MockDataChannel::pair("message", a_sink, b_sink);

        a.send(ChannelPayload::Text("hello".into())).await.unwrap();
        let events = drain(&mut b_rx);
        assert!(matches!(
            events.as_slice(),
            [PeerEvent::ChannelMessage { label, payload: ChannelPayload::Text(text) }]
                if label == "message" && text == "hello"
        ));
        assert!(drain(&mut a_rx).is_empty());

        b.close().await;
        assert!(!a.is_open());
        assert_eq!(
            a.send(ChannelPayload::Text("late".into())).await,
            Err(CapabilityError::ChannelClosed)
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn offer_and_answer_link_two_connections() {
        let factory = MockConnectionFactory::new();
        let (caller_sink, mut caller_rx) = sink(1);
        let (answerer_sink, mut answerer_rx) = sink(1);
        let caller = factory.create(caller_sink).await.unwrap();
        let answerer = factory.create(answerer_sink).await.unwrap();

        let camera = MediaTrack::new(TrackKind::Video, "camera");
        caller.add_track(camera.clone()).await.unwrap();
        let channel = caller.create_data_channel("message").await.unwrap();
        assert!(!channel.is_open());

        let offer = caller.create_offer().await.unwrap();
        caller.set_local_description(offer.clone()).await.unwrap();
        let gathered = drain(&mut caller_rx);
        assert!(matches!(gathered[0], PeerEvent::IceCandidate(Some(_))));
        assert!(matches!(gathered[1], PeerEvent::IceCandidate(None)));

        answerer.set_remote_description(offer).await.unwrap();
        assert!(channel.is_open());
        let events = drain(&mut answerer_rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, PeerEvent::DataChannel(ch) if ch.label() == "message")));
        assert!(events
            .iter()
            .any(|event| matches!(event, PeerEvent::Track(track) if track.id() == camera.id())));

        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();
        assert!(drain(&mut caller_rx).iter().any(|event| matches!(
            event,
            PeerEvent::ConnectionState(ConnectionState::Connected)
        )));

        caller.close().await;
        assert!(!channel.is_open());
        assert!(drain(&mut answerer_rx).iter().any(|event| matches!(
            event,
            PeerEvent::ConnectionState(ConnectionState::Disconnected)
        )));
        assert_eq!(factory.connections()[0].calls().last(), Some(&MockCall::Close));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn replace_track_needs_a_sender_of_that_kind() {
        let factory = MockConnectionFactory::new();
        let (events, _rx) = sink(1);
        let connection = factory.create(events).await.unwrap();
        let screen = MediaTrack::new(TrackKind::Video, "screen");

        assert_eq!(
            connection.replace_track(TrackKind::Video, screen.clone()).await,
            Err(CapabilityError::NoSender(TrackKind::Video))
        );

        connection
            .add_track(MediaTrack::new(TrackKind::Video, "camera"))
            .await
            .unwrap();
        connection
            .replace_track(TrackKind::Video, screen.clone())
            .await
            .unwrap();
        let mock = factory.last().unwrap();
        assert!(Arc::ptr_eq(&mock.sender(TrackKind::Video).unwrap(), &screen));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn candidates_require_remote_description() {
        let factory = MockConnectionFactory::new();
        let (events, _rx) = sink(1);
        let connection = factory.create(events).await.unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:9 1 udp 1 127.0.0.1 9 typ host".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        };
        assert!(matches!(
            connection.add_ice_candidate(candidate).await,
            Err(CapabilityError::Negotiation(_))
        ));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn denied_capture_fails() {
        assert!(MockScreenCapture::denying().capture().await.is_err());
        let capture = MockScreenCapture::new();
        let track = capture.capture().await.unwrap();
        assert_eq!(track.kind(), TrackKind::Video);
        assert_eq!(capture.captured().len(), 1);
    }

    #[test_timeout::timeout]
    fn origin_is_read_from_sdp() {
        assert_eq!(
            mock_origin("v=0\r\no=mock 42 0 IN IP4 127.0.0.1\r\ns=parley\r\n"),
            Some(42)
        );
        assert_eq!(mock_origin("v=0\r\no=- 42 0 IN IP4 0.0.0.0\r\n"), None);
    }
}
