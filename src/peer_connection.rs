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

//! Adapter over one media transport. Tracks local and remote SSRC-to-track
//! bindings, keeps local SSRCs stable across sender detach/re-attach cycles
//! and configures the simulcast encoding ladder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::config::VideoConfig;
use crate::errors::{EngineError, EngineResult};
use crate::id::{ParticipantId, TrackId};
use crate::sdp::consistency::{SsrcConsistencyLayer, TrackView};
use crate::sdp::{MediaKind, SourceUpdate, TransportDescription};
use crate::signaling::{IceCandidateInit, PresenceResolver, VideoSubtype};
use crate::transport::{
    EncodingParameters, IceConnectionState, MediaTransport, OfferOptions, TransportStats,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrackInfo {
    pub track: TrackId,
    pub kind: MediaKind,
    pub subtype: Option<VideoSubtype>,
}

impl LocalTrackInfo {
    pub fn audio(track: impl Into<TrackId>) -> Self {
        Self { track: track.into(), kind: MediaKind::Audio, subtype: None }
    }

    pub fn camera(track: impl Into<TrackId>) -> Self {
        Self { track: track.into(), kind: MediaKind::Video, subtype: Some(VideoSubtype::Camera) }
    }

    pub fn desktop(track: impl Into<TrackId>) -> Self {
        Self { track: track.into(), kind: MediaKind::Video, subtype: Some(VideoSubtype::Desktop) }
    }
}

/// Binding of a local track to its media source. Survives mute/unmute: the
/// binding (and the SSRC memo behind it) persists even while the underlying
/// sender is detached.
#[derive(Debug, Clone)]
pub struct LocalTrackBinding {
    pub info: LocalTrackInfo,
    pub muted: bool,
    pub encodings: Vec<EncodingParameters>,
}

impl LocalTrackBinding {
    /// Camera video is physically detached from the transport while muted
    /// (mute-as-detach); audio and desktop senders stay attached, disabled.
    pub fn attached(&self) -> bool {
        !(self.muted
            && self.info.kind == MediaKind::Video
            && self.info.subtype == Some(VideoSubtype::Camera))
    }

    fn view(&self) -> TrackView {
        TrackView {
            track: self.info.track.clone(),
            kind: self.info.kind,
            attached: self.attached(),
        }
    }
}

/// Binding of an inbound synchronization source to its owning participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackBinding {
    pub ssrc: u32,
    pub rtx: Option<u32>,
    pub participant: ParticipantId,
    pub kind: MediaKind,
    pub muted: bool,
    pub video_subtype: Option<VideoSubtype>,
}

#[derive(Debug, Default, Clone)]
pub struct RemoteSourceChange {
    pub added: Vec<RemoteTrackBinding>,
    pub removed: Vec<u32>,
}

impl RemoteSourceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct PeerConnectionAdapter {
    transport: Box<dyn MediaTransport>,
    resolver: Arc<dyn PresenceResolver>,
    video: VideoConfig,
    cname: String,
    stream_label: String,
    local_tracks: Mutex<Vec<LocalTrackBinding>>,
    remote_tracks: Mutex<HashMap<u32, RemoteTrackBinding>>,
    consistency: Mutex<SsrcConsistencyLayer>,
    // Sender-side cap requested by the remote party, 0 = uncapped.
    max_send_height: AtomicU32,
}

impl std::fmt::Debug for PeerConnectionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionAdapter")
            .field("local_tracks", &self.local_tracks.lock().len())
            .field("remote_tracks", &self.remote_tracks.lock().len())
            .finish()
    }
}

impl PeerConnectionAdapter {
    pub fn new(
        transport: Box<dyn MediaTransport>,
        resolver: Arc<dyn PresenceResolver>,
        video: VideoConfig,
        local_endpoint: &ParticipantId,
    ) -> Self {
        let cname: String =
            rand::thread_rng().sample_iter(&Alphanumeric).take(16).map(char::from).collect();
        Self {
            transport,
            resolver,
            video,
            cname,
            stream_label: local_endpoint.to_string(),
            local_tracks: Mutex::new(Vec::new()),
            remote_tracks: Mutex::new(HashMap::new()),
            consistency: Mutex::new(SsrcConsistencyLayer::new()),
            max_send_height: AtomicU32::new(0),
        }
    }

    pub fn local_track_infos(&self) -> Vec<LocalTrackInfo> {
        self.local_tracks.lock().iter().map(|b| b.info.clone()).collect()
    }

    pub fn local_track(&self, track: &TrackId) -> Option<LocalTrackBinding> {
        self.local_tracks.lock().iter().find(|b| b.info.track == *track).cloned()
    }

    pub fn remote_track_bindings(&self) -> Vec<RemoteTrackBinding> {
        self.remote_tracks.lock().values().cloned().collect()
    }

    pub fn find_remote_by_ssrc(&self, ssrc: u32) -> Option<RemoteTrackBinding> {
        self.remote_tracks.lock().get(&ssrc).cloned()
    }

    /// The SSRC the remote party currently associates with `track`, if one
    /// was ever assigned.
    pub fn local_primary_ssrc(&self, track: &TrackId) -> Option<u32> {
        self.consistency.lock().memo(track).map(|m| m.primary)
    }

    pub async fn add_track(&self, info: LocalTrackInfo) -> EngineResult<()> {
        {
            let tracks = self.local_tracks.lock();
            if tracks.iter().any(|b| b.info.track == info.track) {
                return Err(EngineError::InvalidState(format!(
                    "track {} already added",
                    info.track
                )));
            }
        }

        self.transport.attach_sender(&info.track, info.kind).await?;
        let encodings = match info.kind {
            MediaKind::Video => {
                let encodings = self.compute_encodings(info.subtype);
                self.transport.set_sender_encodings(&info.track, &encodings).await?;
                encodings
            }
            MediaKind::Audio => Vec::new(),
        };

        self.local_tracks.lock().push(LocalTrackBinding { info, muted: false, encodings });
        Ok(())
    }

    pub async fn remove_track(&self, track: &TrackId) -> EngineResult<()> {
        let binding = {
            let mut tracks = self.local_tracks.lock();
            let idx = tracks
                .iter()
                .position(|b| b.info.track == *track)
                .ok_or_else(|| EngineError::InvalidState(format!("unknown track {}", track)))?;
            tracks.remove(idx)
        };
        if binding.attached() {
            self.transport.detach_sender(track).await?;
        }
        // The SSRC memo is deliberately kept: if the same track comes back
        // within this adapter's lifetime it keeps its stream identity.
        Ok(())
    }

    pub async fn replace_track(&self, old: &TrackId, new: LocalTrackInfo) -> EngineResult<()> {
        let previous = self
            .local_track(old)
            .ok_or_else(|| EngineError::InvalidState(format!("unknown track {}", old)))?;
        if previous.info.kind != new.kind {
            return Err(EngineError::InvalidState(format!(
                "cannot replace {} track with {} track",
                previous.info.kind.as_str(),
                new.kind.as_str()
            )));
        }

        if previous.attached() {
            self.transport.detach_sender(old).await?;
        }
        self.consistency.lock().transfer(old, new.track.clone());

        let mut binding = LocalTrackBinding {
            info: new,
            muted: previous.muted,
            encodings: previous.encodings.clone(),
        };
        if binding.attached() {
            self.transport.attach_sender(&binding.info.track, binding.info.kind).await?;
            if binding.info.kind == MediaKind::Video {
                binding.encodings = self.compute_encodings(binding.info.subtype);
                self.transport
                    .set_sender_encodings(&binding.info.track, &binding.encodings)
                    .await?;
            }
        }

        let mut tracks = self.local_tracks.lock();
        let idx = tracks
            .iter()
            .position(|b| b.info.track == *old)
            .ok_or_else(|| EngineError::InvalidState(format!("unknown track {}", old)))?;
        tracks[idx] = binding;
        Ok(())
    }

    /// Returns true when the mute state actually changed.
    pub async fn set_track_muted(&self, track: &TrackId, muted: bool) -> EngineResult<bool> {
        let binding = self
            .local_track(track)
            .ok_or_else(|| EngineError::InvalidState(format!("unknown track {}", track)))?;
        if binding.muted == muted {
            return Ok(false);
        }

        let detaches = binding.info.kind == MediaKind::Video
            && binding.info.subtype == Some(VideoSubtype::Camera);
        if detaches {
            if muted {
                self.transport.detach_sender(track).await?;
            } else {
                self.transport.attach_sender(track, MediaKind::Video).await?;
                let encodings = self.compute_encodings(binding.info.subtype);
                self.transport.set_sender_encodings(track, &encodings).await?;
            }
        } else {
            self.transport.set_sender_enabled(track, !muted).await?;
        }

        let mut tracks = self.local_tracks.lock();
        if let Some(b) = tracks.iter_mut().find(|b| b.info.track == *track) {
            b.muted = muted;
        }
        Ok(true)
    }

    /// Pauses or resumes media transfer without touching bindings or SSRCs;
    /// used while this adapter's session is suspended in favor of another
    /// transport.
    pub async fn set_media_suspended(&self, suspended: bool) -> EngineResult<()> {
        let bindings: Vec<LocalTrackBinding> = self.local_tracks.lock().clone();
        for binding in bindings {
            if !binding.attached() {
                continue;
            }
            let enabled = !suspended && !binding.muted;
            self.transport.set_sender_enabled(&binding.info.track, enabled).await?;
        }
        Ok(())
    }

    /// Creates the next local description: the transport's offer, rewritten
    /// for SSRC consistency, applied locally and returned for signaling.
    pub async fn create_local_description(
        &self,
        options: OfferOptions,
    ) -> EngineResult<TransportDescription> {
        let mut offer = self.transport.create_offer(options).await?;
        self.pin_local_sources(&mut offer);
        self.transport.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Creates an answer to the current remote description, with the same
    /// consistency treatment as an offer.
    pub async fn create_answer_description(&self) -> EngineResult<TransportDescription> {
        let mut answer = self.transport.create_answer().await?;
        self.pin_local_sources(&mut answer);
        self.transport.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    fn pin_local_sources(&self, description: &mut TransportDescription) {
        let views: Vec<TrackView> = self.local_tracks.lock().iter().map(|b| b.view()).collect();
        self.consistency.lock().apply(description, &views, &self.cname, &self.stream_label);
    }

    /// Applies a full remote description and reports the resulting remote
    /// source delta.
    pub async fn apply_remote_description(
        &self,
        description: TransportDescription,
    ) -> EngineResult<RemoteSourceChange> {
        self.transport.set_remote_description(description.clone()).await?;

        let mut change = RemoteSourceChange::default();
        for section in &description.sections {
            let update = SourceUpdate {
                kind: section.kind,
                sources: section.sources.clone(),
                ssrc_groups: section.ssrc_groups.clone(),
            };
            change.added.append(&mut self.register_remote_sources(&update));
        }

        // Sources that vanished from the full description are gone.
        let present: Vec<u32> = description.ssrcs();
        let stale: Vec<u32> = {
            let remote = self.remote_tracks.lock();
            remote.keys().filter(|ssrc| !present.contains(ssrc)).copied().collect()
        };
        change.removed.extend(self.unregister_remote_ssrcs(&stale));

        Ok(change)
    }

    /// Incremental `source-add`: registers new remote sources without a full
    /// description exchange.
    pub fn apply_remote_source_add(&self, updates: &[SourceUpdate]) -> Vec<RemoteTrackBinding> {
        updates.iter().flat_map(|update| self.register_remote_sources(update)).collect()
    }

    /// Incremental `source-remove`.
    pub fn apply_remote_source_remove(&self, updates: &[SourceUpdate]) -> Vec<u32> {
        let ssrcs: Vec<u32> = updates
            .iter()
            .flat_map(|update| update.sources.iter().map(|s| s.ssrc))
            .collect();
        self.unregister_remote_ssrcs(&ssrcs)
    }

    pub fn remove_remote_participant(&self, participant: &ParticipantId) -> Vec<u32> {
        let mut remote = self.remote_tracks.lock();
        let ssrcs: Vec<u32> = remote
            .iter()
            .filter(|(_, b)| b.participant == *participant)
            .map(|(ssrc, _)| *ssrc)
            .collect();
        for ssrc in &ssrcs {
            remote.remove(ssrc);
        }
        ssrcs
    }

    fn register_remote_sources(&self, update: &SourceUpdate) -> Vec<RemoteTrackBinding> {
        let mut added = Vec::new();
        let mut remote = self.remote_tracks.lock();

        let is_rtx = |ssrc: u32| {
            update
                .ssrc_groups
                .iter()
                .filter(|g| g.is_fid())
                .any(|g| g.ssrcs.iter().skip(1).any(|&s| s == ssrc))
        };
        let rtx_of = |primary: u32| {
            update
                .ssrc_groups
                .iter()
                .filter(|g| g.is_fid())
                .find(|g| g.ssrcs.first() == Some(&primary))
                .and_then(|g| g.ssrcs.get(1))
                .copied()
        };

        for source in &update.sources {
            if is_rtx(source.ssrc) {
                continue;
            }
            // The owning participant id travels in the msid stream part;
            // the description itself carries no identity.
            let participant = ParticipantId::from(source.stream.clone());
            if let Some(existing) = remote.get(&source.ssrc) {
                if existing.participant != participant {
                    log::error!(
                        "ssrc {} already bound to {}, refusing reassignment to {}",
                        source.ssrc,
                        existing.participant,
                        participant
                    );
                }
                continue;
            }

            let presence = self.resolver.media_info(&participant, update.kind);
            let binding = RemoteTrackBinding {
                ssrc: source.ssrc,
                rtx: rtx_of(source.ssrc),
                participant,
                kind: update.kind,
                muted: presence.muted,
                video_subtype: match update.kind {
                    MediaKind::Video => presence.video_subtype.or(Some(VideoSubtype::Camera)),
                    MediaKind::Audio => None,
                },
            };
            remote.insert(source.ssrc, binding.clone());
            added.push(binding);
        }
        added
    }

    fn unregister_remote_ssrcs(&self, ssrcs: &[u32]) -> Vec<u32> {
        let mut remote = self.remote_tracks.lock();
        ssrcs.iter().filter(|ssrc| remote.remove(ssrc).is_some()).copied().collect()
    }

    /// Caps the sending resolution; layers above the cap are deactivated,
    /// never removed, so lifting the cap is a parameter update only.
    pub async fn set_max_send_frame_height(&self, max_height: u32) -> EngineResult<()> {
        self.max_send_height.store(max_height, Ordering::Release);
        let videos: Vec<LocalTrackBinding> = self
            .local_tracks
            .lock()
            .iter()
            .filter(|b| b.info.kind == MediaKind::Video)
            .cloned()
            .collect();
        for binding in videos {
            let encodings = self.compute_encodings(binding.info.subtype);
            if binding.attached() {
                self.transport.set_sender_encodings(&binding.info.track, &encodings).await?;
            }
            let mut tracks = self.local_tracks.lock();
            if let Some(b) = tracks.iter_mut().find(|b| b.info.track == binding.info.track) {
                b.encodings = encodings;
            }
        }
        Ok(())
    }

    fn compute_encodings(&self, subtype: Option<VideoSubtype>) -> Vec<EncodingParameters> {
        let cap = self.max_send_height.load(Ordering::Acquire);
        let simulcast = self.video.simulcast && subtype != Some(VideoSubtype::Desktop);

        if !simulcast {
            let top = match self.video.ladder.last() {
                Some(layer) => layer,
                None => return Vec::new(),
            };
            return vec![EncodingParameters {
                rid: top.rid.to_owned(),
                scale_resolution_down_by: 1.0,
                max_bitrate: top.max_bitrate,
                active: true,
            }];
        }

        self.video
            .ladder
            .iter()
            .enumerate()
            .map(|(i, layer)| EncodingParameters {
                rid: layer.rid.to_owned(),
                scale_resolution_down_by: layer.scale_down_by,
                max_bitrate: layer.max_bitrate,
                // The lowest layer always stays active so the remote side
                // keeps receiving something under a tight cap.
                active: cap == 0 || layer.height <= cap || i == 0,
            })
            .collect()
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> EngineResult<()> {
        self.transport.add_ice_candidate(candidate).await
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.transport.ice_state()
    }

    pub async fn get_stats(&self) -> EngineResult<TransportStats> {
        self.transport.get_stats().await
    }

    pub fn close(&self) {
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoLayer;
    use crate::sdp::SourceInfo;

    struct NoTransport;

    #[async_trait::async_trait]
    impl MediaTransport for NoTransport {
        async fn attach_sender(&self, _: &TrackId, _: MediaKind) -> EngineResult<()> {
            Ok(())
        }
        async fn detach_sender(&self, _: &TrackId) -> EngineResult<()> {
            Ok(())
        }
        async fn set_sender_enabled(&self, _: &TrackId, _: bool) -> EngineResult<()> {
            Ok(())
        }
        async fn set_sender_encodings(
            &self,
            _: &TrackId,
            _: &[EncodingParameters],
        ) -> EngineResult<()> {
            Ok(())
        }
        async fn create_offer(&self, _: OfferOptions) -> EngineResult<TransportDescription> {
            Ok(TransportDescription::default())
        }
        async fn create_answer(&self) -> EngineResult<TransportDescription> {
            Ok(TransportDescription::default())
        }
        async fn set_local_description(&self, _: TransportDescription) -> EngineResult<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _: TransportDescription) -> EngineResult<()> {
            Ok(())
        }
        fn current_remote_description(&self) -> Option<TransportDescription> {
            None
        }
        async fn add_ice_candidate(&self, _: IceCandidateInit) -> EngineResult<()> {
            Ok(())
        }
        fn ice_state(&self) -> IceConnectionState {
            IceConnectionState::New
        }
        async fn get_stats(&self) -> EngineResult<TransportStats> {
            Ok(TransportStats::default())
        }
        fn close(&self) {}
    }

    struct NoPresence;
    impl PresenceResolver for NoPresence {
        fn media_info(&self, _: &ParticipantId, _: MediaKind) -> crate::signaling::PresenceMediaInfo {
            Default::default()
        }
    }

    fn make_adapter(video: VideoConfig) -> PeerConnectionAdapter {
        PeerConnectionAdapter::new(
            Box::new(NoTransport),
            Arc::new(NoPresence),
            video,
            &"self".into(),
        )
    }

    #[tokio::test]
    async fn simulcast_ladder_has_three_layers() {
        let adapter = make_adapter(VideoConfig::default());
        let encodings = adapter.compute_encodings(Some(VideoSubtype::Camera));
        assert_eq!(encodings.len(), 3);
        assert!(encodings.iter().all(|e| e.active));
        assert_eq!(encodings[0].scale_resolution_down_by, 4.0);
        assert_eq!(encodings[2].scale_resolution_down_by, 1.0);
    }

    #[tokio::test]
    async fn desktop_and_disabled_simulcast_collapse_to_one_layer() {
        let adapter = make_adapter(VideoConfig::default());
        let desktop = adapter.compute_encodings(Some(VideoSubtype::Desktop));
        assert_eq!(desktop.len(), 1);
        assert_eq!(desktop[0].scale_resolution_down_by, 1.0);

        let adapter = make_adapter(VideoConfig { simulcast: false, ..Default::default() });
        let camera = adapter.compute_encodings(Some(VideoSubtype::Camera));
        assert_eq!(camera.len(), 1);
    }

    #[tokio::test]
    async fn send_height_cap_deactivates_upper_layers() {
        let adapter = make_adapter(VideoConfig {
            simulcast: true,
            ladder: vec![
                VideoLayer { rid: "q", scale_down_by: 4.0, height: 180, max_bitrate: 1 },
                VideoLayer { rid: "h", scale_down_by: 2.0, height: 360, max_bitrate: 2 },
                VideoLayer { rid: "f", scale_down_by: 1.0, height: 720, max_bitrate: 3 },
            ],
        });
        adapter.set_max_send_frame_height(360).await.unwrap();
        let encodings = adapter.compute_encodings(Some(VideoSubtype::Camera));
        assert_eq!(
            encodings.iter().map(|e| e.active).collect::<Vec<_>>(),
            vec![true, true, false]
        );

        // A cap below the lowest layer still leaves it active.
        adapter.set_max_send_frame_height(90).await.unwrap();
        let encodings = adapter.compute_encodings(Some(VideoSubtype::Camera));
        assert_eq!(
            encodings.iter().map(|e| e.active).collect::<Vec<_>>(),
            vec![true, false, false]
        );
    }

    fn audio_update(stream: &str, ssrc: u32) -> SourceUpdate {
        SourceUpdate {
            kind: MediaKind::Audio,
            sources: vec![SourceInfo {
                ssrc,
                cname: "remote".into(),
                stream: stream.into(),
                track: format!("{}-mic", stream),
            }],
            ssrc_groups: Vec::new(),
        }
    }

    #[tokio::test]
    async fn ssrc_reassignment_to_another_participant_is_refused() {
        let adapter = make_adapter(VideoConfig::default());

        let added = adapter.apply_remote_source_add(&[audio_update("peer1", 500)]);
        assert_eq!(added.len(), 1);

        // A second participant claiming the same ssrc is rejected; the
        // original binding stays in place.
        let added = adapter.apply_remote_source_add(&[audio_update("peer2", 500)]);
        assert!(added.is_empty());
        assert_eq!(
            adapter.find_remote_by_ssrc(500).unwrap().participant,
            ParticipantId::from("peer1")
        );
    }
}
