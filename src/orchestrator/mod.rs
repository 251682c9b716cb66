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

//! Holds the live sessions (at most one relay, one peer-to-peer), the
//! conference-wide remote track registry, endpoint selection state and the
//! relay control channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RetryConfig;
use crate::errors::{EngineError, EngineResult};
use crate::id::ParticipantId;
use crate::peer_connection::{LocalTrackInfo, RemoteTrackBinding};
use crate::sdp::MediaKind;
use crate::session::{MediaSession, TransportKind};

pub mod bridge_channel;

pub use bridge_channel::{
    BridgeChannel, BridgeEvent, BridgeEvents, BridgeMessage, ControlChannelFactory,
    ControlChannelHandle, SenderConstraints,
};

/// Receive-side endpoint selection, relay-wide. `last_n == -1` means
/// unlimited.
#[derive(Debug, Clone)]
pub struct EndpointSelectionState {
    pub last_n: i32,
    pub pinned: Option<ParticipantId>,
    pub selected: Vec<ParticipantId>,
    pub max_frame_height: Option<u32>,
}

impl Default for EndpointSelectionState {
    fn default() -> Self {
        Self { last_n: -1, pinned: None, selected: Vec::new(), max_frame_height: None }
    }
}

pub struct TransportOrchestrator {
    sessions: Mutex<HashMap<TransportKind, Arc<MediaSession>>>,
    active: Mutex<Option<TransportKind>>,
    // One binding per (participant, kind); a later session's sources win.
    remote_bindings: Mutex<HashMap<(ParticipantId, MediaKind), RemoteTrackBinding>>,
    selection: Mutex<EndpointSelectionState>,
    bridge: BridgeChannel,
    switch_pending: AtomicBool,
}

impl std::fmt::Debug for TransportOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOrchestrator")
            .field("active", &*self.active.lock())
            .field("sessions", &self.sessions.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TransportOrchestrator {
    pub fn new(
        channel_factory: Arc<dyn ControlChannelFactory>,
        channel_retry: RetryConfig,
    ) -> (Self, BridgeEvents) {
        let (bridge, bridge_events) = BridgeChannel::new(channel_factory, channel_retry);
        (
            Self {
                sessions: Mutex::new(HashMap::new()),
                active: Mutex::new(None),
                remote_bindings: Mutex::new(HashMap::new()),
                selection: Mutex::new(EndpointSelectionState::default()),
                bridge,
                switch_pending: AtomicBool::new(false),
            },
            bridge_events,
        )
    }

    /// Registers a session under its kind. A second session of the same kind
    /// is a policy error; the old one must be taken out first.
    pub fn register_session(&self, session: Arc<MediaSession>) -> EngineResult<()> {
        let kind = session.kind();
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&kind) {
            return Err(EngineError::InvalidState(format!(
                "a {:?} session is already registered",
                kind
            )));
        }
        sessions.insert(kind, session);

        let mut active = self.active.lock();
        if active.is_none() {
            *active = Some(kind);
        }
        Ok(())
    }

    pub fn take_session(&self, kind: TransportKind) -> Option<Arc<MediaSession>> {
        let removed = self.sessions.lock().remove(&kind);
        if removed.is_some() {
            let mut active = self.active.lock();
            if *active == Some(kind) {
                *active = self.sessions.lock().keys().next().copied();
            }
        }
        removed
    }

    pub fn session(&self, kind: TransportKind) -> Option<Arc<MediaSession>> {
        self.sessions.lock().get(&kind).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<MediaSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn session_by_id(&self, id: &crate::id::SessionId) -> Option<Arc<MediaSession>> {
        self.sessions.lock().values().find(|s| s.id() == id).cloned()
    }

    pub fn active_kind(&self) -> Option<TransportKind> {
        *self.active.lock()
    }

    pub fn active_session(&self) -> Option<Arc<MediaSession>> {
        let kind = (*self.active.lock())?;
        self.session(kind)
    }

    pub fn set_active(&self, kind: TransportKind) -> EngineResult<()> {
        if !self.sessions.lock().contains_key(&kind) {
            return Err(EngineError::InvalidState(format!("no {:?} session", kind)));
        }
        *self.active.lock() = Some(kind);
        Ok(())
    }

    /// At most one transport switch may be in flight; callers that lose the
    /// race must retry after the current switch settles.
    pub fn begin_switch(&self) -> EngineResult<()> {
        if self.switch_pending.swap(true, Ordering::AcqRel) {
            return Err(EngineError::InvalidState("transport switch already pending".into()));
        }
        Ok(())
    }

    pub fn end_switch(&self) {
        self.switch_pending.store(false, Ordering::Release);
    }

    /// Local tracks of the active session.
    pub fn local_tracks(&self) -> Vec<LocalTrackInfo> {
        self.active_session().map(|s| s.adapter().local_track_infos()).unwrap_or_default()
    }

    /// Remote tracks merged across sessions, de-duplicated per
    /// (participant, kind) with the active session's bindings preferred.
    pub fn remote_tracks(&self) -> Vec<RemoteTrackBinding> {
        let active = self.active_kind();
        let sessions = self.sessions.lock();

        let mut merged: HashMap<(ParticipantId, MediaKind), RemoteTrackBinding> = HashMap::new();
        let mut insert_all = |session: &Arc<MediaSession>| {
            for binding in session.adapter().remote_track_bindings() {
                merged.insert((binding.participant.clone(), binding.kind), binding);
            }
        };
        for (kind, session) in sessions.iter() {
            if Some(*kind) != active {
                insert_all(session);
            }
        }
        if let Some(kind) = active {
            if let Some(session) = sessions.get(&kind) {
                insert_all(session);
            }
        }
        merged.into_values().collect()
    }

    /// Conference-wide registry update from a session's remote source
    /// events; last writer wins per (participant, kind).
    pub fn on_remote_sources_added(&self, bindings: &[RemoteTrackBinding]) {
        let mut registry = self.remote_bindings.lock();
        for binding in bindings {
            registry.insert((binding.participant.clone(), binding.kind), binding.clone());
        }
    }

    pub fn on_remote_sources_removed(&self, ssrcs: &[u32]) {
        let mut registry = self.remote_bindings.lock();
        registry.retain(|_, binding| {
            !ssrcs.contains(&binding.ssrc) && !binding.rtx.is_some_and(|r| ssrcs.contains(&r))
        });
    }

    /// Drops the participant's registry entries and their per-session
    /// bindings. Returns the SSRCs that were released.
    pub fn on_participant_left(&self, participant: &ParticipantId) -> Vec<u32> {
        let mut released = Vec::new();
        for session in self.sessions.lock().values() {
            released.extend(session.adapter().remove_remote_participant(participant));
        }
        self.remote_bindings.lock().retain(|(owner, _), _| owner != participant);
        released
    }

    pub fn find_by_ssrc(&self, ssrc: u32) -> Option<RemoteTrackBinding> {
        self.remote_bindings.lock().values().find(|b| b.ssrc == ssrc).cloned()
    }

    pub fn remote_binding(
        &self,
        participant: &ParticipantId,
        kind: MediaKind,
    ) -> Option<RemoteTrackBinding> {
        self.remote_bindings.lock().get(&(participant.clone(), kind)).cloned()
    }

    pub fn selection(&self) -> EndpointSelectionState {
        self.selection.lock().clone()
    }

    pub fn set_last_n(&self, last_n: i32) -> EngineResult<()> {
        self.selection.lock().last_n = last_n;
        self.bridge.set_last_n(last_n)
    }

    pub fn pin_endpoint(&self, endpoint: Option<ParticipantId>) -> EngineResult<()> {
        self.selection.lock().pinned = endpoint.clone();
        self.bridge.pin_endpoint(endpoint.as_ref())
    }

    pub fn select_endpoints(&self, endpoints: Vec<ParticipantId>) -> EngineResult<()> {
        self.selection.lock().selected = endpoints.clone();
        self.bridge.select_endpoints(&endpoints)
    }

    /// Receive-resolution preference, propagated relay-wide on the control
    /// channel and per-session as `content-modify` to an active
    /// peer-to-peer remote.
    pub async fn set_receiver_video_constraint(&self, max_frame_height: u32) -> EngineResult<()> {
        self.selection.lock().max_frame_height = Some(max_frame_height);
        self.bridge.set_receiver_video_constraint(max_frame_height)?;

        let p2p = self.session(TransportKind::PeerToPeer);
        if let Some(session) = p2p {
            if let Err(err) = session.set_receiver_video_constraint(max_frame_height).await {
                log::warn!("content-modify not delivered to peer session: {}", err);
            }
        }
        Ok(())
    }

    pub fn bridge(&self) -> &BridgeChannel {
        &self.bridge
    }

    pub fn close(&self) {
        self.bridge.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_defaults_to_unlimited() {
        let selection = EndpointSelectionState::default();
        assert_eq!(selection.last_n, -1);
        assert!(selection.pinned.is_none());
        assert!(selection.selected.is_empty());
    }
}
