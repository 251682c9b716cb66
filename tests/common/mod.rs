// Copyright 2024 the confrtc project authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use confrtc::config::VideoConfig;
use confrtc::errors::{EngineError, EngineResult};
use confrtc::id::{ParticipantId, SessionId, TrackId};
use confrtc::orchestrator::{ControlChannelFactory, ControlChannelHandle};
use confrtc::sdp::{MediaKind, MediaSection, SourceInfo, SsrcGroup, TransportDescription};
use confrtc::session::{
    MediaSession, SessionConfig, SessionEvents, SessionRole, TransportKind,
};
use confrtc::signaling::{
    IceCandidateInit, PresenceMediaInfo, PresenceResolver, SignalingMessage, SignalingSink,
};
use confrtc::transport::{
    EncodingParameters, IceConnectionState, MediaTransport, OfferOptions, TransportEmitter,
    TransportEvent, TransportEvents, TransportStats,
};
use confrtc::SessionFactory;

/// Idempotent; called from the harness constructors so `RUST_LOG` works in
/// every test binary.
pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory transport double. Assigns a fresh SSRC pair on every sender
/// attach, which is exactly the behavior the consistency layer has to hide.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockTransportInner>,
}

struct MockTransportInner {
    state: Mutex<MockTransportState>,
    emitter: TransportEmitter,
    in_apply: AtomicBool,
    overlap: AtomicBool,
}

struct SenderState {
    kind: MediaKind,
    enabled: bool,
    primary: u32,
    rtx: Option<u32>,
    encodings: Vec<EncodingParameters>,
}

struct MockTransportState {
    senders: Vec<(TrackId, SenderState)>,
    next_ssrc: u32,
    version: u64,
    ice: IceConnectionState,
    remote: Option<TransportDescription>,
    candidates: Vec<IceCandidateInit>,
    apply_delay: Option<Duration>,
    attach_count: usize,
    detach_count: usize,
    restart_offers: usize,
    closed: bool,
}

impl MockTransport {
    pub fn new() -> (Self, TransportEvents) {
        let (emitter, events) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(MockTransportInner {
                state: Mutex::new(MockTransportState {
                    senders: Vec::new(),
                    next_ssrc: 100,
                    version: 0,
                    ice: IceConnectionState::New,
                    remote: None,
                    candidates: Vec::new(),
                    apply_delay: None,
                    attach_count: 0,
                    detach_count: 0,
                    restart_offers: 0,
                    closed: false,
                }),
                emitter,
                in_apply: AtomicBool::new(false),
                overlap: AtomicBool::new(false),
            }),
        };
        (transport, events)
    }

    pub fn set_ice(&self, state: IceConnectionState) {
        self.inner.state.lock().ice = state;
        let _ = self.inner.emitter.send(TransportEvent::IceStateChanged { state });
    }

    pub fn emit_candidate(&self, candidate: &str) {
        let _ = self.inner.emitter.send(TransportEvent::IceCandidate {
            candidate: IceCandidateInit {
                sdp_mid: "0".into(),
                sdp_m_line_index: 0,
                candidate: candidate.into(),
            },
        });
    }

    pub fn emit_suspended(&self) {
        let _ = self.inner.emitter.send(TransportEvent::Suspended);
    }

    /// Slows down description application so overlapping renegotiations
    /// would be caught by `overlap_detected`.
    pub fn set_apply_delay(&self, delay: Duration) {
        self.inner.state.lock().apply_delay = Some(delay);
    }

    pub fn overlap_detected(&self) -> bool {
        self.inner.overlap.load(Ordering::SeqCst)
    }

    pub fn sender_attached(&self, track: &TrackId) -> bool {
        self.inner.state.lock().senders.iter().any(|(t, _)| t == track)
    }

    pub fn sender_enabled(&self, track: &TrackId) -> Option<bool> {
        self.inner
            .state
            .lock()
            .senders
            .iter()
            .find(|(t, _)| t == track)
            .map(|(_, s)| s.enabled)
    }

    pub fn sender_encodings(&self, track: &TrackId) -> Option<Vec<EncodingParameters>> {
        self.inner
            .state
            .lock()
            .senders
            .iter()
            .find(|(t, _)| t == track)
            .map(|(_, s)| s.encodings.clone())
    }

    /// The SSRC the transport itself currently uses for `track`; changes on
    /// every re-attach.
    pub fn raw_primary_ssrc(&self, track: &TrackId) -> Option<u32> {
        self.inner
            .state
            .lock()
            .senders
            .iter()
            .find(|(t, _)| t == track)
            .map(|(_, s)| s.primary)
    }

    pub fn attach_count(&self) -> usize {
        self.inner.state.lock().attach_count
    }

    pub fn detach_count(&self) -> usize {
        self.inner.state.lock().detach_count
    }

    pub fn restart_offers(&self) -> usize {
        self.inner.state.lock().restart_offers
    }

    pub fn received_candidates(&self) -> Vec<IceCandidateInit> {
        self.inner.state.lock().candidates.clone()
    }

    pub fn closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    fn build_description(&self) -> TransportDescription {
        let mut state = self.inner.state.lock();
        state.version += 1;

        let mut audio = MediaSection::new(MediaKind::Audio, "0");
        let mut video = MediaSection::new(MediaKind::Video, "1");
        for (track, sender) in &state.senders {
            let section = match sender.kind {
                MediaKind::Audio => &mut audio,
                MediaKind::Video => &mut video,
            };
            section.sources.push(SourceInfo {
                ssrc: sender.primary,
                cname: "mock".into(),
                stream: "local".into(),
                track: track.to_string(),
            });
            if let Some(rtx) = sender.rtx {
                section.sources.push(SourceInfo {
                    ssrc: rtx,
                    cname: "mock".into(),
                    stream: "local".into(),
                    track: track.to_string(),
                });
                section.ssrc_groups.push(SsrcGroup::fid(sender.primary, rtx));
            }
        }
        TransportDescription { version: state.version, sections: vec![audio, video] }
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn attach_sender(&self, track: &TrackId, kind: MediaKind) -> EngineResult<()> {
        let mut state = self.inner.state.lock();
        let primary = state.next_ssrc;
        state.next_ssrc += 1;
        let rtx = match kind {
            MediaKind::Video => {
                let rtx = state.next_ssrc;
                state.next_ssrc += 1;
                Some(rtx)
            }
            MediaKind::Audio => None,
        };
        state.attach_count += 1;
        state.senders.push((
            track.clone(),
            SenderState { kind, enabled: true, primary, rtx, encodings: Vec::new() },
        ));
        Ok(())
    }

    async fn detach_sender(&self, track: &TrackId) -> EngineResult<()> {
        let mut state = self.inner.state.lock();
        state.detach_count += 1;
        state.senders.retain(|(t, _)| t != track);
        Ok(())
    }

    async fn set_sender_enabled(&self, track: &TrackId, enabled: bool) -> EngineResult<()> {
        let mut state = self.inner.state.lock();
        match state.senders.iter_mut().find(|(t, _)| t == track) {
            Some((_, sender)) => {
                sender.enabled = enabled;
                Ok(())
            }
            None => Err(EngineError::Internal(format!("no sender for {}", track))),
        }
    }

    async fn set_sender_encodings(
        &self,
        track: &TrackId,
        encodings: &[EncodingParameters],
    ) -> EngineResult<()> {
        let mut state = self.inner.state.lock();
        match state.senders.iter_mut().find(|(t, _)| t == track) {
            Some((_, sender)) => {
                sender.encodings = encodings.to_vec();
                Ok(())
            }
            None => Err(EngineError::Internal(format!("no sender for {}", track))),
        }
    }

    async fn create_offer(&self, options: OfferOptions) -> EngineResult<TransportDescription> {
        if options.ice_restart {
            self.inner.state.lock().restart_offers += 1;
        }
        Ok(self.build_description())
    }

    async fn create_answer(&self) -> EngineResult<TransportDescription> {
        Ok(self.build_description())
    }

    async fn set_local_description(&self, _: TransportDescription) -> EngineResult<()> {
        if self.inner.in_apply.swap(true, Ordering::SeqCst) {
            self.inner.overlap.store(true, Ordering::SeqCst);
        }
        let delay = self.inner.state.lock().apply_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.in_apply.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_remote_description(&self, description: TransportDescription) -> EngineResult<()> {
        self.inner.state.lock().remote = Some(description);
        Ok(())
    }

    fn current_remote_description(&self) -> Option<TransportDescription> {
        self.inner.state.lock().remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> EngineResult<()> {
        self.inner.state.lock().candidates.push(candidate);
        Ok(())
    }

    fn ice_state(&self) -> IceConnectionState {
        self.inner.state.lock().ice
    }

    async fn get_stats(&self) -> EngineResult<TransportStats> {
        Ok(TransportStats { bytes_sent: 1, ..Default::default() })
    }

    fn close(&self) {
        self.inner.state.lock().closed = true;
    }
}

/// Collects everything the engine tried to signal.
#[derive(Clone, Default)]
pub struct MockSignaling {
    messages: Arc<Mutex<Vec<(ParticipantId, SignalingMessage)>>>,
}

impl MockSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(ParticipantId, SignalingMessage)> {
        self.messages.lock().clone()
    }

    pub fn take(&self) -> Vec<(ParticipantId, SignalingMessage)> {
        std::mem::take(&mut *self.messages.lock())
    }
}

#[async_trait]
impl SignalingSink for MockSignaling {
    async fn send(&self, to: &ParticipantId, message: SignalingMessage) -> EngineResult<()> {
        self.messages.lock().push((to.clone(), message));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPresence {
    info: Mutex<HashMap<(ParticipantId, MediaKind), PresenceMediaInfo>>,
}

impl MockPresence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, participant: &ParticipantId, kind: MediaKind, info: PresenceMediaInfo) {
        self.info.lock().insert((participant.clone(), kind), info);
    }
}

impl PresenceResolver for MockPresence {
    fn media_info(&self, participant: &ParticipantId, kind: MediaKind) -> PresenceMediaInfo {
        self.info.lock().get(&(participant.clone(), kind)).copied().unwrap_or_default()
    }
}

/// The relay-side end of a mock control channel connection.
pub struct ServerEnd {
    pub tx: mpsc::UnboundedSender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

#[derive(Default)]
pub struct MockChannelFactory {
    state: Mutex<ChannelFactoryState>,
}

#[derive(Default)]
struct ChannelFactoryState {
    fail_remaining: u32,
    connects: u32,
    servers: Vec<ServerEnd>,
}

impl MockChannelFactory {
    pub fn new() -> Arc<Self> {
        init_log();
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, attempts: u32) {
        self.state.lock().fail_remaining = attempts;
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    /// The server end of the most recent successful connection.
    pub fn take_server(&self) -> Option<ServerEnd> {
        self.state.lock().servers.pop()
    }
}

#[async_trait]
impl ControlChannelFactory for MockChannelFactory {
    async fn connect(&self) -> EngineResult<ControlChannelHandle> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(EngineError::ChannelUnavailable);
        }
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        state.servers.push(ServerEnd { tx: server_tx, rx: server_rx });
        Ok(ControlChannelHandle { tx: client_tx, rx: client_rx })
    }
}

/// Session factory wiring mock transports into real sessions, keeping the
/// transports around so tests can drive ICE states and candidates.
pub struct MockSessionFactory {
    signaling: Arc<MockSignaling>,
    resolver: Arc<MockPresence>,
    video: VideoConfig,
    transports: Mutex<Vec<(TransportKind, MockTransport)>>,
}

impl MockSessionFactory {
    pub fn new(signaling: Arc<MockSignaling>, resolver: Arc<MockPresence>) -> Arc<Self> {
        Arc::new(Self {
            signaling,
            resolver,
            video: VideoConfig::default(),
            transports: Mutex::new(Vec::new()),
        })
    }

    /// The most recently created transport of the given kind.
    pub fn transport(&self, kind: TransportKind) -> Option<MockTransport> {
        self.transports.lock().iter().rev().find(|(k, _)| *k == kind).map(|(_, t)| t.clone())
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create_session(
        &self,
        id: SessionId,
        kind: TransportKind,
        role: SessionRole,
        remote: ParticipantId,
    ) -> EngineResult<(Arc<MediaSession>, SessionEvents)> {
        let (transport, transport_events) = MockTransport::new();
        self.transports.lock().push((kind, transport.clone()));

        let (session, events) = MediaSession::new(
            SessionConfig { id, role, kind, remote, video: self.video.clone() },
            Box::new(transport),
            transport_events,
            self.signaling.clone(),
            self.resolver.clone(),
        );
        Ok((Arc::new(session), events))
    }
}

/// Builds a standalone session around mocks; the transport handle is
/// returned for direct manipulation.
pub fn new_session(
    role: SessionRole,
    kind: TransportKind,
    remote: &str,
    signaling: Arc<MockSignaling>,
) -> (Arc<MediaSession>, SessionEvents, MockTransport) {
    init_log();
    let (transport, transport_events) = MockTransport::new();
    let (session, events) = MediaSession::new(
        SessionConfig {
            id: SessionId::from("sid-test"),
            role,
            kind,
            remote: ParticipantId::from(remote),
            video: VideoConfig::default(),
        },
        Box::new(transport.clone()),
        transport_events,
        signaling,
        MockPresence::new(),
    );
    (Arc::new(session), events, transport)
}

/// A remote description with one audio source owned by `participant`.
pub fn remote_audio_description(participant: &str, ssrc: u32) -> TransportDescription {
    let mut audio = MediaSection::new(MediaKind::Audio, "0");
    audio.sources.push(SourceInfo {
        ssrc,
        cname: "remote".into(),
        stream: participant.into(),
        track: format!("{}-mic", participant),
    });
    TransportDescription {
        version: 1,
        sections: vec![audio, MediaSection::new(MediaKind::Video, "1")],
    }
}

/// Lets spawned tasks make progress without advancing the paused clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
