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

//! Client-side media-conferencing engine: session negotiation and transport
//! orchestration for a conference that can run over a media relay, directly
//! peer-to-peer, or switch between the two mid-call.
//!
//! The platform pieces (the actual RTC stack, the signaling wire format,
//! presence) stay outside the crate, behind the [`transport::MediaTransport`],
//! [`signaling::SignalingSink`], [`signaling::PresenceResolver`] and
//! [`orchestrator::ControlChannelFactory`] traits.

pub mod config;
pub mod controller;
pub mod errors;
pub mod id;
pub mod orchestrator;
pub mod peer_connection;
pub mod sdp;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod utils;

pub use config::ConferenceConfig;
pub use controller::{ConferenceController, ConferenceEvent, ConferenceEvents, SessionFactory};
pub use errors::{EngineError, EngineResult};
pub use id::{ParticipantId, SessionId, TrackId};

pub mod prelude {
    pub use crate::config::{
        ConferenceConfig, IceRecoveryConfig, P2pConfig, RetryConfig, VideoConfig, VideoLayer,
    };
    pub use crate::controller::{
        ConferenceController, ConferenceEvent, ConferenceEvents, SessionFactory,
    };
    pub use crate::errors::{EngineError, EngineResult};
    pub use crate::id::{ParticipantId, SessionId, TrackId};
    pub use crate::orchestrator::{
        BridgeChannel, BridgeEvent, BridgeMessage, ControlChannelFactory, ControlChannelHandle,
        EndpointSelectionState, TransportOrchestrator,
    };
    pub use crate::peer_connection::{
        LocalTrackInfo, PeerConnectionAdapter, RemoteTrackBinding,
    };
    pub use crate::sdp::{MediaKind, SourceUpdate, TransportDescription};
    pub use crate::session::{
        MediaSession, SessionConfig, SessionEvent, SessionEvents, SessionRole, SessionState,
        TransportKind,
    };
    pub use crate::signaling::{
        IceCandidateInit, PresenceResolver, SignalingMessage, SignalingSink, TerminateReason,
        VideoSubtype,
    };
    pub use crate::transport::{
        EncodingParameters, IceConnectionState, MediaTransport, OfferOptions, TransportEvent,
        TransportEvents, TransportStats,
    };
}
