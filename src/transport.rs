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

//! Seam over the platform RTC stack. Production implementations wrap a real
//! peer connection; tests drive the engine with an in-memory double.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::EngineResult;
use crate::id::TrackId;
use crate::sdp::{MediaKind, TransportDescription};
use crate::signaling::IceCandidateInit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct OfferOptions {
    pub ice_restart: bool,
}

/// One simulcast (or singleton) encoding of a local video sender.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingParameters {
    pub rid: String,
    pub scale_resolution_down_by: f64,
    pub max_bitrate: u64,
    pub active: bool,
}

/// Transport-level statistics snapshot; read-only relative to negotiation.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub round_trip_time_ms: Option<f64>,
    pub audio_level: Option<f64>,
}

#[derive(Debug)]
pub enum TransportEvent {
    IceCandidate { candidate: IceCandidateInit },
    IceStateChanged { state: IceConnectionState },
    /// The device slept or the transport was torn down underneath us.
    Suspended,
}

pub type TransportEmitter = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// The underlying media transport owned by one peer-connection adapter.
///
/// Contract: a sender attached for `track` must expose the track id in the
/// msid track part of the source it generates, so outgoing descriptions can
/// be correlated with local track bindings. The transport is free to assign
/// a fresh SSRC on every attach; SSRC stability is the adapter's job, not
/// the transport's.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn attach_sender(&self, track: &TrackId, kind: MediaKind) -> EngineResult<()>;
    async fn detach_sender(&self, track: &TrackId) -> EngineResult<()>;
    /// Enables or disables a sender without detaching it.
    async fn set_sender_enabled(&self, track: &TrackId, enabled: bool) -> EngineResult<()>;
    async fn set_sender_encodings(
        &self,
        track: &TrackId,
        encodings: &[EncodingParameters],
    ) -> EngineResult<()>;

    async fn create_offer(&self, options: OfferOptions) -> EngineResult<TransportDescription>;
    async fn create_answer(&self) -> EngineResult<TransportDescription>;
    async fn set_local_description(&self, description: TransportDescription) -> EngineResult<()>;
    async fn set_remote_description(&self, description: TransportDescription) -> EngineResult<()>;
    fn current_remote_description(&self) -> Option<TransportDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> EngineResult<()>;
    fn ice_state(&self) -> IceConnectionState;

    async fn get_stats(&self) -> EngineResult<TransportStats>;
    fn close(&self);
}
