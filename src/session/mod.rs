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

//! One signaling session (relay or peer-to-peer) driven through its
//! protocol lifecycle. All mutating operations are serialized through an
//! ordered task queue so no two renegotiations race on the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::{EngineError, EngineResult};
use crate::id::{ParticipantId, SessionId, TrackId};
use crate::peer_connection::{LocalTrackInfo, PeerConnectionAdapter, RemoteSourceChange};
use crate::sdp::{source_diff, SourceUpdate, TransportDescription};
use crate::signaling::{
    IceCandidateInit, PresenceResolver, SignalingMessage, SignalingSink, TerminateReason,
};
use crate::transport::{
    IceConnectionState, MediaTransport, OfferOptions, TransportEvent, TransportEvents,
    TransportStats,
};
use crate::utils::task_queue::TaskQueue;
use crate::config::VideoConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// Transport kind as a tagged variant; behavior differences are branches on
/// this tag, not subclasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Relay,
    PeerToPeer,
}

pub type SessionEmitter = mpsc::UnboundedSender<SessionEvent>;
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

#[derive(Debug)]
pub enum SessionEvent {
    StateChanged { state: SessionState },
    RemoteSourcesAdded { bindings: Vec<crate::peer_connection::RemoteTrackBinding> },
    RemoteSourcesRemoved { ssrcs: Vec<u32> },
    IceStateChanged { state: IceConnectionState },
    IceFailed,
    /// Terminal event; emitted exactly once per session.
    Terminated { reason: TerminateReason, by_remote: bool },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub id: SessionId,
    pub role: SessionRole,
    pub kind: TransportKind,
    /// Remote signaling address: the focus for relay sessions, the peer for
    /// peer-to-peer sessions.
    pub remote: ParticipantId,
    pub video: VideoConfig,
}

/// A serialized mutation of the local media state. Everything that can
/// change the local description goes through one of these.
#[derive(Debug, Clone)]
enum TrackOp {
    Add(LocalTrackInfo),
    Remove(TrackId),
    Replace(TrackId, LocalTrackInfo),
    SetMuted(TrackId, bool),
    Suspend(bool),
    MaxSendHeight(u32),
}

impl TrackOp {
    /// Suspend and encoding updates never move SSRC lines, so they skip the
    /// renegotiation round entirely.
    fn renegotiates(&self) -> bool {
        !matches!(self, TrackOp::Suspend(_) | TrackOp::MaxSendHeight(_))
    }
}

struct SessionInner {
    config: SessionConfig,
    adapter: PeerConnectionAdapter,
    signaling: Arc<dyn SignalingSink>,
    state: Mutex<SessionState>,
    queue: TaskQueue,
    emitter: SessionEmitter,
    last_local: Mutex<Option<TransportDescription>>,
    terminated: AtomicBool,
}

pub struct MediaSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession")
            .field("id", &self.inner.config.id)
            .field("kind", &self.inner.config.kind)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl MediaSession {
    pub fn new(
        config: SessionConfig,
        transport: Box<dyn MediaTransport>,
        transport_events: TransportEvents,
        signaling: Arc<dyn SignalingSink>,
        resolver: Arc<dyn PresenceResolver>,
    ) -> (Self, SessionEvents) {
        let (emitter, events) = mpsc::unbounded_channel();

        let adapter = PeerConnectionAdapter::new(
            transport,
            resolver,
            config.video.clone(),
            &config.remote,
        );
        let queue = TaskQueue::new(format!("session-{}", config.id));

        let inner = Arc::new(SessionInner {
            config,
            adapter,
            signaling,
            state: Mutex::new(SessionState::Pending),
            queue,
            emitter,
            last_local: Mutex::new(None),
            terminated: AtomicBool::new(false),
        });

        tokio::spawn(transport_event_task(inner.clone(), transport_events));

        (Self { inner }, events)
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.config.id
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.config.kind
    }

    pub fn role(&self) -> SessionRole {
        self.inner.config.role
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.inner.config.remote
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn adapter(&self) -> &PeerConnectionAdapter {
        &self.inner.adapter
    }

    /// Initiator only: builds an offer from `tracks` and sends
    /// `session-initiate`. The session stays `Pending` until the remote
    /// accept arrives.
    pub async fn initiate(&self, tracks: Vec<LocalTrackInfo>) -> EngineResult<()> {
        if self.inner.config.role != SessionRole::Initiator {
            return Err(EngineError::Negotiation("initiate called on responder".into()));
        }
        let inner = self.inner.clone();
        let result = self
            .inner
            .queue
            .run(async move {
                inner.expect_state(SessionState::Pending, "session-initiate")?;
                for track in tracks {
                    inner.adapter.add_track(track).await?;
                }
                let offer =
                    inner.adapter.create_local_description(OfferOptions::default()).await?;
                *inner.last_local.lock() = Some(offer.clone());
                inner
                    .signaling
                    .send(
                        &inner.config.remote,
                        SignalingMessage::SessionInitiate {
                            session_id: inner.config.id.clone(),
                            description: offer,
                        },
                    )
                    .await
            })
            .await?;
        self.inner.fatal_on_negotiation_error(result).await
    }

    /// Responder only: applies the remote offer, adds `tracks`, sends the
    /// answer as `session-accept` and activates the session.
    pub async fn accept_offer(
        &self,
        offer: TransportDescription,
        tracks: Vec<LocalTrackInfo>,
    ) -> EngineResult<()> {
        if self.inner.config.role != SessionRole::Responder {
            return Err(EngineError::Negotiation("accept_offer called on initiator".into()));
        }
        let inner = self.inner.clone();
        let result = self
            .inner
            .queue
            .run(async move {
                inner.expect_state(SessionState::Pending, "session-accept")?;
                let change = inner.adapter.apply_remote_description(offer).await?;
                inner.emit_remote_change(change);

                for track in tracks {
                    inner.adapter.add_track(track).await?;
                }
                let answer = inner.adapter.create_answer_description().await?;
                *inner.last_local.lock() = Some(answer.clone());
                inner
                    .signaling
                    .send(
                        &inner.config.remote,
                        SignalingMessage::SessionAccept {
                            session_id: inner.config.id.clone(),
                            description: answer,
                        },
                    )
                    .await?;
                inner.set_state(SessionState::Active);
                Ok(())
            })
            .await?;
        self.inner.fatal_on_negotiation_error(result).await
    }

    /// Initiator side of the offer/answer exchange: the remote party
    /// accepted our offer.
    pub async fn handle_accept(&self, answer: TransportDescription) -> EngineResult<()> {
        let inner = self.inner.clone();
        let result = self
            .inner
            .queue
            .run(async move {
                // Copy the state out so the lock is not held across the
                // description exchange below.
                let state = *inner.state.lock();
                match state {
                    SessionState::Pending => {}
                    // A transport-replace answer while active is applied in
                    // place without a state change.
                    SessionState::Active => {
                        let change = inner.adapter.apply_remote_description(answer).await?;
                        inner.emit_remote_change(change);
                        return Ok(());
                    }
                    SessionState::Ended => {
                        return Err(EngineError::InvalidState("session ended".into()))
                    }
                }
                let change = inner.adapter.apply_remote_description(answer).await?;
                inner.emit_remote_change(change);
                inner.set_state(SessionState::Active);
                Ok(())
            })
            .await?;
        self.inner.fatal_on_negotiation_error(result).await
    }

    pub async fn add_track(&self, info: LocalTrackInfo) -> EngineResult<()> {
        self.run_op(TrackOp::Add(info)).await
    }

    pub async fn remove_track(&self, track: TrackId) -> EngineResult<()> {
        self.run_op(TrackOp::Remove(track)).await
    }

    pub async fn replace_track(&self, old: TrackId, new: LocalTrackInfo) -> EngineResult<()> {
        self.run_op(TrackOp::Replace(old, new)).await
    }

    pub async fn set_track_muted(&self, track: TrackId, muted: bool) -> EngineResult<()> {
        self.run_op(TrackOp::SetMuted(track, muted)).await
    }

    /// Pauses/resumes media transfer while this session is suspended in
    /// favor of the other transport.
    pub async fn set_media_suspended(&self, suspended: bool) -> EngineResult<()> {
        self.run_op(TrackOp::Suspend(suspended)).await
    }

    /// Applies an inbound `content-modify` from the remote party.
    pub async fn handle_content_modify(&self, max_frame_height: u32) -> EngineResult<()> {
        self.run_op(TrackOp::MaxSendHeight(max_frame_height)).await
    }

    /// Signals the preferred receive resolution. Does not renegotiate.
    pub async fn set_receiver_video_constraint(&self, max_frame_height: u32) -> EngineResult<()> {
        if self.state() == SessionState::Ended {
            return Err(EngineError::InvalidState("session ended".into()));
        }
        self.inner
            .signaling
            .send(
                &self.inner.config.remote,
                SignalingMessage::ContentModify {
                    session_id: self.inner.config.id.clone(),
                    max_frame_height,
                },
            )
            .await
    }

    /// Inbound `source-add`. Malformed updates are logged and ignored.
    pub fn handle_source_add(&self, updates: Vec<SourceUpdate>) {
        if self.state() == SessionState::Ended {
            log::debug!("{}: ignoring source-add after end", self.inner.config.id);
            return;
        }
        let added = self.inner.adapter.apply_remote_source_add(&updates);
        if !added.is_empty() {
            let _ = self.inner.emitter.send(SessionEvent::RemoteSourcesAdded { bindings: added });
        }
    }

    /// Inbound `source-remove`.
    pub fn handle_source_remove(&self, updates: Vec<SourceUpdate>) {
        if self.state() == SessionState::Ended {
            log::debug!("{}: ignoring source-remove after end", self.inner.config.id);
            return;
        }
        let removed = self.inner.adapter.apply_remote_source_remove(&updates);
        if !removed.is_empty() {
            let _ = self.inner.emitter.send(SessionEvent::RemoteSourcesRemoved { ssrcs: removed });
        }
    }

    pub async fn add_remote_candidate(&self, candidate: IceCandidateInit) -> EngineResult<()> {
        self.inner.adapter.add_ice_candidate(candidate).await
    }

    /// Requests an ICE restart by sending a replacement offer.
    pub async fn restart_ice(&self) -> EngineResult<()> {
        let inner = self.inner.clone();
        self.inner
            .queue
            .run(async move {
                inner.expect_state(SessionState::Active, "transport-replace")?;
                let offer = inner
                    .adapter
                    .create_local_description(OfferOptions { ice_restart: true })
                    .await?;
                *inner.last_local.lock() = Some(offer.clone());
                inner
                    .signaling
                    .send(
                        &inner.config.remote,
                        SignalingMessage::TransportReplace {
                            session_id: inner.config.id.clone(),
                            description: offer,
                        },
                    )
                    .await
            })
            .await?
    }

    /// Responder side of an ICE restart: applies the replacement offer and
    /// answers it (re-using `session-accept` as the acknowledgement).
    pub async fn handle_transport_replace(
        &self,
        offer: TransportDescription,
    ) -> EngineResult<()> {
        let inner = self.inner.clone();
        self.inner
            .queue
            .run(async move {
                inner.expect_state(SessionState::Active, "transport-replace")?;
                let change = inner.adapter.apply_remote_description(offer).await?;
                inner.emit_remote_change(change);
                let answer = inner.adapter.create_answer_description().await?;
                *inner.last_local.lock() = Some(answer.clone());
                inner
                    .signaling
                    .send(
                        &inner.config.remote,
                        SignalingMessage::SessionAccept {
                            session_id: inner.config.id.clone(),
                            description: answer,
                        },
                    )
                    .await
            })
            .await?
    }

    pub async fn get_stats(&self) -> EngineResult<TransportStats> {
        self.inner.adapter.get_stats().await
    }

    /// Terminates the session. `session-terminate` is suppressed when the
    /// transport already dropped (suspend detection).
    pub async fn terminate(&self, reason: TerminateReason) -> EngineResult<()> {
        let send = reason != TerminateReason::Suspended;
        self.inner.do_terminate(reason, send, false).await;
        Ok(())
    }

    /// Inbound `session-terminate` from the remote party.
    pub async fn handle_terminate(&self, reason: TerminateReason) {
        self.inner.do_terminate(reason, false, true).await;
    }

    async fn run_op(&self, op: TrackOp) -> EngineResult<()> {
        let inner = self.inner.clone();
        self.inner.queue.run(async move { inner.run_track_op(op).await }).await?
    }
}

impl SessionInner {
    fn expect_state(&self, expected: SessionState, what: &str) -> EngineResult<()> {
        let state = *self.state.lock();
        if state != expected {
            return Err(EngineError::Negotiation(format!(
                "{} not allowed in {:?} state",
                what, state
            )));
        }
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
        let _ = self.emitter.send(SessionEvent::StateChanged { state });
    }

    fn emit_remote_change(&self, change: RemoteSourceChange) {
        if !change.added.is_empty() {
            let _ = self.emitter.send(SessionEvent::RemoteSourcesAdded { bindings: change.added });
        }
        if !change.removed.is_empty() {
            let _ =
                self.emitter.send(SessionEvent::RemoteSourcesRemoved { ssrcs: change.removed });
        }
    }

    /// A negotiation failure during the initial offer/answer is fatal for
    /// the whole session.
    async fn fatal_on_negotiation_error(&self, result: EngineResult<()>) -> EngineResult<()> {
        if let Err(err) = &result {
            match err {
                EngineError::Negotiation(_) | EngineError::DescriptionRejected(_) => {
                    log::error!("{}: fatal negotiation failure: {}", self.config.id, err);
                    self.do_terminate(TerminateReason::Error, true, false).await;
                }
                _ => {}
            }
        }
        result
    }

    async fn run_track_op(&self, op: TrackOp) -> EngineResult<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(EngineError::InvalidState("session ended".into()));
        }

        let renegotiates = op.renegotiates();
        match op {
            TrackOp::Add(info) => self.adapter.add_track(info).await?,
            TrackOp::Remove(track) => self.adapter.remove_track(&track).await?,
            TrackOp::Replace(old, new) => self.adapter.replace_track(&old, new).await?,
            TrackOp::SetMuted(track, muted) => {
                if !self.adapter.set_track_muted(&track, muted).await? {
                    return Ok(());
                }
            }
            TrackOp::Suspend(suspended) => self.adapter.set_media_suspended(suspended).await?,
            TrackOp::MaxSendHeight(height) => {
                self.adapter.set_max_send_frame_height(height).await?
            }
        }

        // Before the session is active the mutation simply rides the
        // upcoming initial offer/answer.
        if !renegotiates || *self.state.lock() != SessionState::Active {
            return Ok(());
        }

        let old = self.last_local.lock().clone();
        let new_desc = self.adapter.create_local_description(OfferOptions::default()).await?;

        // The renegotiation cannot be cancelled mid-flight, but its outcome
        // is discarded if the session ended meanwhile.
        if self.terminated.load(Ordering::Acquire) {
            return Ok(());
        }
        *self.last_local.lock() = Some(new_desc.clone());

        let Some(old) = old else {
            return Ok(());
        };
        let diff = source_diff(&old, &new_desc);
        if !diff.added.is_empty() {
            self.signaling
                .send(
                    &self.config.remote,
                    SignalingMessage::SourceAdd {
                        session_id: self.config.id.clone(),
                        updates: diff.added,
                    },
                )
                .await?;
        }
        if !diff.removed.is_empty() {
            self.signaling
                .send(
                    &self.config.remote,
                    SignalingMessage::SourceRemove {
                        session_id: self.config.id.clone(),
                        updates: diff.removed,
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn do_terminate(&self, reason: TerminateReason, send: bool, by_remote: bool) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock() = SessionState::Ended;

        if send {
            let message = SignalingMessage::SessionTerminate {
                session_id: self.config.id.clone(),
                reason,
            };
            if let Err(err) = self.signaling.send(&self.config.remote, message).await {
                log::warn!("{}: failed to send session-terminate: {}", self.config.id, err);
            }
        }

        self.adapter.close();
        let _ = self.emitter.send(SessionEvent::Terminated { reason, by_remote });
        log::info!("{}: session ended ({:?}, by_remote={})", self.config.id, reason, by_remote);
    }
}

async fn transport_event_task(inner: Arc<SessionInner>, mut events: TransportEvents) {
    while let Some(event) = events.recv().await {
        if inner.terminated.load(Ordering::Acquire) {
            break;
        }
        match event {
            TransportEvent::IceCandidate { candidate } => {
                let message = SignalingMessage::TransportInfo {
                    session_id: inner.config.id.clone(),
                    candidates: vec![candidate],
                };
                if let Err(err) = inner.signaling.send(&inner.config.remote, message).await {
                    log::warn!("{}: failed to send transport-info: {}", inner.config.id, err);
                }
            }
            TransportEvent::IceStateChanged { state } => {
                let _ = inner.emitter.send(SessionEvent::IceStateChanged { state });
                if state == IceConnectionState::Failed {
                    let _ = inner.emitter.send(SessionEvent::IceFailed);
                }
            }
            TransportEvent::Suspended => {
                inner.do_terminate(TerminateReason::Suspended, false, false).await;
                break;
            }
        }
    }
    log::debug!("{}: transport event task closed", inner.config.id);
}
