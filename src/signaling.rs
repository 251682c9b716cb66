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

//! Minimal message shapes the negotiation core exchanges with the signaling
//! transport. The wire encoding (XMPP or otherwise) is the transport's
//! concern; per-session delivery order is assumed to be preserved by it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::EngineResult;
use crate::id::{ParticipantId, SessionId};
use crate::sdp::{MediaKind, SourceUpdate, TransportDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    Success,
    ConnectivityError,
    Timeout,
    /// The device went to sleep or the transport was suspended; the remote
    /// side is not notified in this case.
    Suspended,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub sdp_mid: String,
    pub sdp_m_line_index: i32,
    pub candidate: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    SessionInitiate { session_id: SessionId, description: TransportDescription },
    SessionAccept { session_id: SessionId, description: TransportDescription },
    SessionTerminate { session_id: SessionId, reason: TerminateReason },
    /// ICE candidates for an established or pending session.
    TransportInfo { session_id: SessionId, candidates: Vec<IceCandidateInit> },
    /// Replacement offer carrying a restarted ICE transport.
    TransportReplace { session_id: SessionId, description: TransportDescription },
    SourceAdd { session_id: SessionId, updates: Vec<SourceUpdate> },
    SourceRemove { session_id: SessionId, updates: Vec<SourceUpdate> },
    /// Preferred receive resolution; never triggers a renegotiation.
    ContentModify { session_id: SessionId, max_frame_height: u32 },
}

impl SignalingMessage {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SignalingMessage::SessionInitiate { session_id, .. }
            | SignalingMessage::SessionAccept { session_id, .. }
            | SignalingMessage::SessionTerminate { session_id, .. }
            | SignalingMessage::TransportInfo { session_id, .. }
            | SignalingMessage::TransportReplace { session_id, .. }
            | SignalingMessage::SourceAdd { session_id, .. }
            | SignalingMessage::SourceRemove { session_id, .. }
            | SignalingMessage::ContentModify { session_id, .. } => session_id,
        }
    }
}

/// Outbound half of the signaling transport. Implementations deliver each
/// message to the addressed remote party.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send(&self, to: &ParticipantId, message: SignalingMessage) -> EngineResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSubtype {
    Camera,
    Desktop,
}

/// Presence-derived metadata of one participant's media, per kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct PresenceMediaInfo {
    pub muted: bool,
    pub video_subtype: Option<VideoSubtype>,
}

/// The transport description alone does not carry participant identity or
/// video subtype; both come from the externally owned presence layer.
pub trait PresenceResolver: Send + Sync {
    fn media_info(&self, participant: &ParticipantId, kind: MediaKind) -> PresenceMediaInfo;
}
