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

//! Top-level conference policy: which transport runs when, how ICE failures
//! are recovered, and the event stream the application consumes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;

use crate::config::ConferenceConfig;
use crate::errors::{EngineError, EngineResult};
use crate::id::{ParticipantId, SessionId};
use crate::orchestrator::{BridgeEvent, BridgeEvents, ControlChannelFactory, TransportOrchestrator};
use crate::peer_connection::{LocalTrackInfo, RemoteTrackBinding};
use crate::session::{
    MediaSession, SessionEvent, SessionEvents, SessionRole, SessionState, TransportKind,
};
use crate::signaling::{SignalingMessage, TerminateReason};
use crate::transport::IceConnectionState;
use crate::utils::debouncer::{debounce, Debouncer};

#[derive(Debug)]
pub enum ConferenceEvent {
    P2pStatusChanged { active: bool },
    SessionStarted { kind: TransportKind },
    SessionEnded { kind: TransportKind, reason: TerminateReason },
    RemoteTracksAdded { bindings: Vec<RemoteTrackBinding> },
    RemoteTracksRemoved { ssrcs: Vec<u32> },
    /// Relay-requested cap on our sending resolution.
    SenderVideoConstraints { ideal_height: u32 },
    LastNEndpointsChanged { entering: Vec<ParticipantId>, leaving: Vec<ParticipantId> },
    FatalError(EngineError),
}

pub type ConferenceEmitter = mpsc::UnboundedSender<ConferenceEvent>;
pub type ConferenceEvents = mpsc::UnboundedReceiver<ConferenceEvent>;

/// Builds a session around whatever transport the platform provides. The
/// session id is assigned by the caller: generated locally for outgoing
/// sessions, taken from the wire for incoming ones.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(
        &self,
        id: SessionId,
        kind: TransportKind,
        role: SessionRole,
        remote: ParticipantId,
    ) -> EngineResult<(Arc<MediaSession>, SessionEvents)>;
}

struct ControllerInner {
    config: ConferenceConfig,
    local: ParticipantId,
    factory: Arc<dyn SessionFactory>,
    orchestrator: Arc<TransportOrchestrator>,
    emitter: ConferenceEmitter,
    remote_participants: Mutex<HashSet<ParticipantId>>,
    p2p_debounce: Mutex<Option<Debouncer>>,
    offline: AtomicBool,
    // ICE recovery bookkeeping is per session: a relay recovery must not
    // re-arm a restart on a still-failed peer-to-peer transport.
    ice_restart_pending: Mutex<HashSet<SessionId>>,
    ice_grace_running: Mutex<HashSet<SessionId>>,
    closed: AtomicBool,
}

pub struct ConferenceController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for ConferenceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConferenceController")
            .field("local", &self.inner.local)
            .field("remotes", &self.inner.remote_participants.lock().len())
            .finish()
    }
}

impl ConferenceController {
    pub fn new(
        config: ConferenceConfig,
        local: ParticipantId,
        factory: Arc<dyn SessionFactory>,
        channel_factory: Arc<dyn ControlChannelFactory>,
    ) -> (Self, ConferenceEvents) {
        let (emitter, events) = mpsc::unbounded_channel();
        let (orchestrator, bridge_events) =
            TransportOrchestrator::new(channel_factory, config.channel_retry.clone());

        let inner = Arc::new(ControllerInner {
            config,
            local,
            factory,
            orchestrator: Arc::new(orchestrator),
            emitter,
            remote_participants: Mutex::new(HashSet::new()),
            p2p_debounce: Mutex::new(None),
            offline: AtomicBool::new(false),
            ice_restart_pending: Mutex::new(HashSet::new()),
            ice_grace_running: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(bridge_event_task(inner.clone(), bridge_events));

        (Self { inner }, events)
    }

    pub fn orchestrator(&self) -> &Arc<TransportOrchestrator> {
        &self.inner.orchestrator
    }

    pub fn local_tracks(&self) -> Vec<LocalTrackInfo> {
        self.inner.orchestrator.local_tracks()
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrackBinding> {
        self.inner.orchestrator.remote_tracks()
    }

    /// Starts an outgoing session of the given kind and sends the initial
    /// offer carrying `tracks`.
    pub async fn start_session(
        &self,
        kind: TransportKind,
        remote: ParticipantId,
        tracks: Vec<LocalTrackInfo>,
    ) -> EngineResult<Arc<MediaSession>> {
        let id = new_session_id();
        let session =
            spawn_session(&self.inner, id, kind, SessionRole::Initiator, remote).await?;
        session.initiate(tracks).await?;
        Ok(session)
    }

    /// Accepts an incoming offer, answering it with `tracks` attached.
    pub async fn accept_session(
        &self,
        id: SessionId,
        kind: TransportKind,
        remote: ParticipantId,
        offer: crate::sdp::TransportDescription,
        tracks: Vec<LocalTrackInfo>,
    ) -> EngineResult<Arc<MediaSession>> {
        let session = spawn_session(&self.inner, id, kind, SessionRole::Responder, remote).await?;
        session.accept_offer(offer, tracks).await?;
        Ok(session)
    }

    /// Routes an inbound signaling message from `from` to the session it
    /// addresses. A `session-initiate` for an unknown session is the
    /// two-party peer opening its side of the call and is answered in
    /// place; other messages for unknown sessions are logged and dropped,
    /// a race with a terminating session is not an error.
    pub async fn handle_signaling(&self, from: ParticipantId, message: SignalingMessage) {
        let Some(session) = self.inner.orchestrator.session_by_id(message.session_id()) else {
            match message {
                SignalingMessage::SessionInitiate { session_id, description } => {
                    self.accept_p2p_offer(from, session_id, description).await;
                }
                other => {
                    log::debug!("dropping signaling for unknown session {}", other.session_id());
                }
            }
            return;
        };
        let result = match message {
            SignalingMessage::SessionAccept { description, .. } => {
                session.handle_accept(description).await
            }
            SignalingMessage::TransportReplace { description, .. } => {
                session.handle_transport_replace(description).await
            }
            SignalingMessage::TransportInfo { candidates, .. } => {
                let mut result = Ok(());
                for candidate in candidates {
                    if let Err(err) = session.add_remote_candidate(candidate).await {
                        result = Err(err);
                    }
                }
                result
            }
            SignalingMessage::SourceAdd { updates, .. } => {
                session.handle_source_add(updates);
                Ok(())
            }
            SignalingMessage::SourceRemove { updates, .. } => {
                session.handle_source_remove(updates);
                Ok(())
            }
            SignalingMessage::ContentModify { max_frame_height, .. } => {
                session.handle_content_modify(max_frame_height).await
            }
            SignalingMessage::SessionTerminate { reason, .. } => {
                session.handle_terminate(reason).await;
                Ok(())
            }
            SignalingMessage::SessionInitiate { session_id, .. } => {
                log::warn!(
                    "session-initiate for already known session {}, ignoring",
                    session_id
                );
                Ok(())
            }
        };
        if let Err(err) = result {
            log::warn!("inbound signaling for {} failed: {}", session.id(), err);
        }
    }

    /// The lesser-id endpoint never initiates peer-to-peer; its session is
    /// created here, under the session id the initiating peer chose.
    async fn accept_p2p_offer(
        &self,
        from: ParticipantId,
        id: SessionId,
        offer: crate::sdp::TransportDescription,
    ) {
        let inner = &self.inner;
        if !inner.config.p2p.enabled
            || inner.closed.load(Ordering::Acquire)
            || !inner.remote_participants.lock().contains(&from)
            || p2p_role(&inner.local, &from) != SessionRole::Responder
            || inner.orchestrator.session(TransportKind::PeerToPeer).is_some()
        {
            log::debug!("dropping session-initiate {} from {}", id, from);
            return;
        }
        if let Some(debouncer) = inner.p2p_debounce.lock().take() {
            debouncer.cancel();
        }
        let tracks = inner.orchestrator.local_tracks();
        if let Err(err) = self
            .accept_session(id, TransportKind::PeerToPeer, from.clone(), offer, tracks)
            .await
        {
            log::error!("failed to accept p2p offer from {}: {}", from, err);
        }
    }

    pub async fn on_participant_joined(&self, participant: ParticipantId) {
        self.inner.remote_participants.lock().insert(participant);
        update_p2p_policy(&self.inner).await;
    }

    pub async fn on_participant_left(&self, participant: ParticipantId) {
        self.inner.remote_participants.lock().remove(&participant);
        let released = self.inner.orchestrator.on_participant_left(&participant);
        if !released.is_empty() {
            let _ = self
                .inner
                .emitter
                .send(ConferenceEvent::RemoteTracksRemoved { ssrcs: released });
        }
        update_p2p_policy(&self.inner).await;
    }

    /// Reported by the platform's connectivity monitor; an ICE failure grace
    /// period does not expire while offline.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::Release);
    }

    pub async fn add_track(&self, info: LocalTrackInfo) -> EngineResult<()> {
        for_all_sessions(&self.inner, |s| {
            let info = info.clone();
            async move { s.add_track(info).await }
        })
        .await
    }

    pub async fn remove_track(&self, track: crate::id::TrackId) -> EngineResult<()> {
        for_all_sessions(&self.inner, |s| {
            let track = track.clone();
            async move { s.remove_track(track).await }
        })
        .await
    }

    pub async fn replace_track(
        &self,
        old: crate::id::TrackId,
        new: LocalTrackInfo,
    ) -> EngineResult<()> {
        for_all_sessions(&self.inner, |s| {
            let old = old.clone();
            let new = new.clone();
            async move { s.replace_track(old, new).await }
        })
        .await
    }

    pub async fn set_track_muted(
        &self,
        track: crate::id::TrackId,
        muted: bool,
    ) -> EngineResult<()> {
        for_all_sessions(&self.inner, |s| {
            let track = track.clone();
            async move { s.set_track_muted(track, muted).await }
        })
        .await
    }

    pub fn set_last_n(&self, last_n: i32) -> EngineResult<()> {
        self.inner.orchestrator.set_last_n(last_n)
    }

    pub fn pin_endpoint(&self, endpoint: Option<ParticipantId>) -> EngineResult<()> {
        self.inner.orchestrator.pin_endpoint(endpoint)
    }

    pub fn select_endpoints(&self, endpoints: Vec<ParticipantId>) -> EngineResult<()> {
        self.inner.orchestrator.select_endpoints(endpoints)
    }

    pub async fn set_receiver_video_constraint(&self, max_frame_height: u32) -> EngineResult<()> {
        self.inner.orchestrator.set_receiver_video_constraint(max_frame_height).await
    }

    /// Ends every session and closes the control channel. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(debouncer) = self.inner.p2p_debounce.lock().take() {
            debouncer.cancel();
        }
        for session in self.inner.orchestrator.sessions() {
            if let Err(err) = session.terminate(TerminateReason::Success).await {
                log::warn!("failed to terminate {}: {}", session.id(), err);
            }
        }
        self.inner.orchestrator.close();
    }
}

fn new_session_id() -> SessionId {
    let suffix: String =
        rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect();
    SessionId::from(format!("sid-{}", suffix))
}

async fn for_all_sessions<F, Fut>(inner: &Arc<ControllerInner>, f: F) -> EngineResult<()>
where
    F: Fn(Arc<MediaSession>) -> Fut,
    Fut: std::future::Future<Output = EngineResult<()>>,
{
    let sessions = inner.orchestrator.sessions();
    if sessions.is_empty() {
        return Err(EngineError::InvalidState("no live session".into()));
    }
    for session in sessions {
        f(session).await?;
    }
    Ok(())
}

async fn spawn_session(
    inner: &Arc<ControllerInner>,
    id: SessionId,
    kind: TransportKind,
    role: SessionRole,
    remote: ParticipantId,
) -> EngineResult<Arc<MediaSession>> {
    let (session, events) = inner.factory.create_session(id, kind, role, remote).await?;
    inner.orchestrator.register_session(session.clone())?;
    tokio::spawn(session_event_task(inner.clone(), session.clone(), events));
    let _ = inner.emitter.send(ConferenceEvent::SessionStarted { kind });
    Ok(session)
}

/// The peer with the greater identifier initiates, so both sides agree on
/// direction without negotiating it.
fn p2p_role(local: &ParticipantId, peer: &ParticipantId) -> SessionRole {
    if local.as_str() > peer.as_str() {
        SessionRole::Initiator
    } else {
        SessionRole::Responder
    }
}

/// Re-evaluates whether peer-to-peer should run, after every membership
/// change. Exactly one remote participant means a two-party call.
async fn update_p2p_policy(inner: &Arc<ControllerInner>) {
    if !inner.config.p2p.enabled || inner.closed.load(Ordering::Acquire) {
        return;
    }
    let (count, peer) = {
        let remotes = inner.remote_participants.lock();
        (remotes.len(), remotes.iter().next().cloned())
    };

    if count == 1 {
        let peer = match peer {
            Some(peer) => peer,
            None => return,
        };
        if inner.orchestrator.session(TransportKind::PeerToPeer).is_some() {
            return;
        }
        let mut pending = inner.p2p_debounce.lock();
        if pending.is_some() {
            return;
        }
        let delayed = {
            let inner = inner.clone();
            async move {
                inner.p2p_debounce.lock().take();
                try_start_p2p(inner, peer).await;
            }
        };
        *pending = Some(debounce(inner.config.p2p.debounce, delayed));
    } else {
        // Third participant (or everyone) arrived or left: no two-party
        // call, cancel any pending start and fall back to the relay.
        if let Some(debouncer) = inner.p2p_debounce.lock().take() {
            debouncer.cancel();
        }
        if inner.orchestrator.active_kind() == Some(TransportKind::PeerToPeer) {
            suspend_p2p(inner).await;
        }
    }
}

async fn try_start_p2p(inner: Arc<ControllerInner>, peer: ParticipantId) {
    // The responder side creates nothing here: the peer's session-initiate
    // arrives with the peer's session id and is answered on receipt.
    if p2p_role(&inner.local, &peer) == SessionRole::Responder {
        log::debug!("waiting for a p2p offer from {}", peer);
        return;
    }
    if inner.orchestrator.begin_switch().is_err() {
        log::warn!("skipping p2p start, another transport switch is pending");
        return;
    }

    let result = async {
        let session = spawn_session(
            &inner,
            new_session_id(),
            TransportKind::PeerToPeer,
            SessionRole::Initiator,
            peer.clone(),
        )
        .await?;
        session.initiate(inner.orchestrator.local_tracks()).await?;
        EngineResult::Ok(())
    }
    .await;

    inner.orchestrator.end_switch();
    if let Err(err) = result {
        log::error!("p2p start towards {} failed: {}", peer, err);
        if let Some(session) = inner.orchestrator.take_session(TransportKind::PeerToPeer) {
            let _ = session.terminate(TerminateReason::Error).await;
        }
    }
}

/// Pauses peer-to-peer media and resumes the relay; the peer-to-peer
/// session itself stays up.
async fn suspend_p2p(inner: &Arc<ControllerInner>) {
    if inner.orchestrator.begin_switch().is_err() {
        log::warn!("skipping p2p suspend, another transport switch is pending");
        return;
    }
    if let Some(p2p) = inner.orchestrator.session(TransportKind::PeerToPeer) {
        if let Err(err) = p2p.set_media_suspended(true).await {
            log::warn!("failed to suspend p2p media: {}", err);
        }
    }
    if let Some(relay) = inner.orchestrator.session(TransportKind::Relay) {
        if let Err(err) = relay.set_media_suspended(false).await {
            log::warn!("failed to resume relay media: {}", err);
        }
        let _ = inner.orchestrator.set_active(TransportKind::Relay);
    }
    inner.orchestrator.end_switch();
    let _ = inner.emitter.send(ConferenceEvent::P2pStatusChanged { active: false });
}

/// Peer-to-peer connected: it becomes the active transport and the relay is
/// paused, not torn down, so falling back later is cheap.
async fn activate_p2p(inner: &Arc<ControllerInner>) {
    if let Some(relay) = inner.orchestrator.session(TransportKind::Relay) {
        if let Err(err) = relay.set_media_suspended(true).await {
            log::warn!("failed to suspend relay media: {}", err);
        }
    }
    let _ = inner.orchestrator.set_active(TransportKind::PeerToPeer);
    let _ = inner.emitter.send(ConferenceEvent::P2pStatusChanged { active: true });
}

async fn session_event_task(
    inner: Arc<ControllerInner>,
    session: Arc<MediaSession>,
    mut events: SessionEvents,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged { state } => {
                if state == SessionState::Active
                    && session.kind() == TransportKind::PeerToPeer
                {
                    activate_p2p(&inner).await;
                }
            }
            SessionEvent::RemoteSourcesAdded { bindings } => {
                inner.orchestrator.on_remote_sources_added(&bindings);
                let _ = inner.emitter.send(ConferenceEvent::RemoteTracksAdded { bindings });
            }
            SessionEvent::RemoteSourcesRemoved { ssrcs } => {
                inner.orchestrator.on_remote_sources_removed(&ssrcs);
                let _ = inner.emitter.send(ConferenceEvent::RemoteTracksRemoved { ssrcs });
            }
            SessionEvent::IceStateChanged { state } => {
                if matches!(
                    state,
                    IceConnectionState::Connected | IceConnectionState::Completed
                ) {
                    inner.ice_restart_pending.lock().remove(session.id());
                }
            }
            SessionEvent::IceFailed => {
                handle_ice_failed(&inner, &session);
            }
            SessionEvent::Terminated { reason, .. } => {
                let kind = session.kind();
                inner.orchestrator.take_session(kind);
                inner.ice_restart_pending.lock().remove(session.id());
                inner.ice_grace_running.lock().remove(session.id());
                let _ = inner.emitter.send(ConferenceEvent::SessionEnded { kind, reason });
                if kind == TransportKind::PeerToPeer
                    && !inner.closed.load(Ordering::Acquire)
                {
                    if let Some(relay) = inner.orchestrator.session(TransportKind::Relay) {
                        if let Err(err) = relay.set_media_suspended(false).await {
                            log::warn!("failed to resume relay media: {}", err);
                        }
                        let _ = inner.orchestrator.set_active(TransportKind::Relay);
                    }
                    let _ =
                        inner.emitter.send(ConferenceEvent::P2pStatusChanged { active: false });
                }
                break;
            }
        }
    }
    log::debug!("{}: session event task closed", session.id());
}

/// ICE failure policy. With auto-restart: at most one restart pending at a
/// time. Without: a grace period runs before the failure is surfaced, and
/// it keeps extending while the device is offline.
fn handle_ice_failed(inner: &Arc<ControllerInner>, session: &Arc<MediaSession>) {
    if inner.config.ice.auto_restart {
        if !inner.ice_restart_pending.lock().insert(session.id().clone()) {
            log::debug!("{}: ice restart already pending", session.id());
            return;
        }
        let session = session.clone();
        tokio::spawn(async move {
            log::warn!("{}: ice failed, restarting", session.id());
            if let Err(err) = session.restart_ice().await {
                log::error!("{}: ice restart failed: {}", session.id(), err);
            }
        });
        return;
    }

    if !inner.ice_grace_running.lock().insert(session.id().clone()) {
        return;
    }
    let inner = inner.clone();
    let session = session.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(inner.config.ice.grace_period).await;
            if !inner.offline.load(Ordering::Acquire) {
                break;
            }
            log::debug!("{}: offline, extending ice failure grace", session.id());
        }
        inner.ice_grace_running.lock().remove(session.id());

        let state = session.adapter().ice_state();
        if matches!(state, IceConnectionState::Connected | IceConnectionState::Completed) {
            log::info!("{}: ice recovered within grace period", session.id());
            return;
        }
        log::error!("{}: ice failure persisted past grace period", session.id());
        let _ = inner.emitter.send(ConferenceEvent::FatalError(EngineError::IceFailed));
        let _ = session.terminate(TerminateReason::ConnectivityError).await;
    });
}

async fn bridge_event_task(inner: Arc<ControllerInner>, mut events: BridgeEvents) {
    while let Some(event) = events.recv().await {
        match event {
            BridgeEvent::Open => log::info!("relay control channel open"),
            BridgeEvent::Closed => log::warn!("relay control channel closed"),
            BridgeEvent::Failed => {
                log::error!("relay control channel unavailable");
            }
            BridgeEvent::SenderVideoConstraints { ideal_height } => {
                if let Some(relay) = inner.orchestrator.session(TransportKind::Relay) {
                    if let Err(err) = relay.handle_content_modify(ideal_height).await {
                        log::warn!("failed to apply sender constraints: {}", err);
                    }
                }
                let _ = inner
                    .emitter
                    .send(ConferenceEvent::SenderVideoConstraints { ideal_height });
            }
            BridgeEvent::LastNEndpointsChanged { entering, leaving } => {
                let _ = inner
                    .emitter
                    .send(ConferenceEvent::LastNEndpointsChanged { entering, leaving });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2p_initiator_is_the_greater_id() {
        let a = ParticipantId::from("alice");
        let b = ParticipantId::from("bob");
        assert_eq!(p2p_role(&b, &a), SessionRole::Initiator);
        assert_eq!(p2p_role(&a, &b), SessionRole::Responder);
    }
}
