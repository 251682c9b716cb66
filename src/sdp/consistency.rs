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

//! Keeps a local track's primary and retransmission SSRC stable across
//! renegotiations. The underlying transport may assign a fresh SSRC every
//! time a sender is (re)attached; outgoing descriptions are rewritten here
//! so the remote side never observes the change. For a track whose sender
//! is currently detached (camera mute), the memoized source declarations
//! are injected so the remote side sees a continuous stream instead of a
//! removal.

use std::collections::HashMap;

use rand::Rng;

use super::{MediaKind, SourceInfo, SsrcGroup, TransportDescription};
use crate::id::TrackId;

/// The previously used SSRC pair of one local track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsrcMemo {
    pub primary: u32,
    pub rtx: Option<u32>,
}

/// How one local track should appear in the next outgoing description.
#[derive(Debug, Clone)]
pub struct TrackView {
    pub track: TrackId,
    pub kind: MediaKind,
    /// False when the sender is currently detached from the transport.
    pub attached: bool,
}

#[derive(Debug, Default)]
pub struct SsrcConsistencyLayer {
    memos: HashMap<TrackId, SsrcMemo>,
}

impl SsrcConsistencyLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memo(&self, track: &TrackId) -> Option<SsrcMemo> {
        self.memos.get(track).copied()
    }

    /// Carries the memo of `old` over to `new`, so a replaced track keeps
    /// the stream identity of the one it replaces.
    pub fn transfer(&mut self, old: &TrackId, new: TrackId) {
        if let Some(memo) = self.memos.remove(old) {
            self.memos.insert(new, memo);
        }
    }

    /// Rewrites `desc` in place so that every track in `tracks` appears with
    /// its memoized SSRCs. First sightings are recorded instead.
    pub fn apply(
        &mut self,
        desc: &mut TransportDescription,
        tracks: &[TrackView],
        cname: &str,
        stream: &str,
    ) {
        for view in tracks {
            if view.attached {
                self.rewrite_attached(desc, view);
            } else {
                self.inject_detached(desc, view, cname, stream);
            }
        }
    }

    fn rewrite_attached(&mut self, desc: &mut TransportDescription, view: &TrackView) {
        let Some(section) = desc.section_mut(view.kind) else {
            return;
        };
        let Some(source) = section.source_by_track(view.track.as_str()) else {
            // The transport hasn't picked the sender up yet; nothing to pin.
            return;
        };
        let current = SsrcMemo { primary: source.ssrc, rtx: section.rtx_of(source.ssrc) };

        match self.memos.get(&view.track) {
            Some(memo) => {
                let memo = *memo;
                section.rewrite_ssrc(current.primary, memo.primary);
                match (current.rtx, memo.rtx) {
                    (Some(old_rtx), Some(new_rtx)) => section.rewrite_ssrc(old_rtx, new_rtx),
                    (Some(old_rtx), None) => {
                        // The memo predates retransmission support for this
                        // track; keep whatever the transport assigned.
                        self.memos.insert(
                            view.track.clone(),
                            SsrcMemo { primary: memo.primary, rtx: Some(old_rtx) },
                        );
                    }
                    _ => {}
                }
            }
            None => {
                self.memos.insert(view.track.clone(), current);
            }
        }
    }

    fn inject_detached(
        &mut self,
        desc: &mut TransportDescription,
        view: &TrackView,
        cname: &str,
        stream: &str,
    ) {
        let memo = match self.memos.get(&view.track) {
            Some(memo) => *memo,
            None => {
                // Muted before the sender was ever attached; allocate now so
                // a later unmute reuses the same pair.
                let memo = self.allocate(view.kind, desc);
                self.memos.insert(view.track.clone(), memo);
                memo
            }
        };

        let Some(section) = desc.section_mut(view.kind) else {
            return;
        };
        if section.source_by_track(view.track.as_str()).is_some() {
            return;
        }

        section.sources.push(SourceInfo {
            ssrc: memo.primary,
            cname: cname.to_owned(),
            stream: stream.to_owned(),
            track: view.track.to_string(),
        });
        if let Some(rtx) = memo.rtx {
            section.sources.push(SourceInfo {
                ssrc: rtx,
                cname: cname.to_owned(),
                stream: stream.to_owned(),
                track: view.track.to_string(),
            });
            section.ssrc_groups.push(SsrcGroup::fid(memo.primary, rtx));
        }
    }

    fn allocate(&self, kind: MediaKind, desc: &TransportDescription) -> SsrcMemo {
        let primary = self.random_ssrc(desc);
        let rtx = match kind {
            MediaKind::Video => {
                let mut rtx = self.random_ssrc(desc);
                while rtx == primary {
                    rtx = self.random_ssrc(desc);
                }
                Some(rtx)
            }
            MediaKind::Audio => None,
        };
        SsrcMemo { primary, rtx }
    }

    fn random_ssrc(&self, desc: &TransportDescription) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: u32 = rng.gen_range(1..=u32::MAX);
            let taken = desc.ssrcs().contains(&candidate)
                || self
                    .memos
                    .values()
                    .any(|m| m.primary == candidate || m.rtx == Some(candidate));
            if !taken {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdp::MediaSection;

    fn desc_with_video(ssrc: u32, rtx: u32, track: &str) -> TransportDescription {
        let mut section = MediaSection::new(MediaKind::Video, "1");
        section.sources.push(SourceInfo {
            ssrc,
            cname: "host".into(),
            stream: "local".into(),
            track: track.into(),
        });
        section.sources.push(SourceInfo {
            ssrc: rtx,
            cname: "host".into(),
            stream: "local".into(),
            track: track.into(),
        });
        section.ssrc_groups.push(SsrcGroup::fid(ssrc, rtx));
        TransportDescription { version: 1, sections: vec![section] }
    }

    fn view(track: &str, attached: bool) -> TrackView {
        TrackView { track: track.into(), kind: MediaKind::Video, attached }
    }

    #[test]
    fn first_sighting_is_recorded() {
        let mut layer = SsrcConsistencyLayer::new();
        let mut desc = desc_with_video(100, 101, "cam");
        layer.apply(&mut desc, &[view("cam", true)], "host", "local");

        assert_eq!(layer.memo(&"cam".into()), Some(SsrcMemo { primary: 100, rtx: Some(101) }));
        // Description unchanged on first sighting.
        assert_eq!(desc.section(MediaKind::Video).unwrap().source(100).unwrap().track, "cam");
    }

    #[test]
    fn reattached_sender_is_rewritten_to_memo() {
        let mut layer = SsrcConsistencyLayer::new();
        let mut first = desc_with_video(100, 101, "cam");
        layer.apply(&mut first, &[view("cam", true)], "host", "local");

        // Transport assigned a fresh pair after a detach/re-attach cycle.
        let mut second = desc_with_video(200, 201, "cam");
        layer.apply(&mut second, &[view("cam", true)], "host", "local");

        let section = second.section(MediaKind::Video).unwrap();
        assert!(section.source(200).is_none());
        assert_eq!(section.source_by_track("cam").unwrap().ssrc, 100);
        assert_eq!(section.rtx_of(100), Some(101));
    }

    #[test]
    fn detached_track_sources_are_injected() {
        let mut layer = SsrcConsistencyLayer::new();
        let mut first = desc_with_video(100, 101, "cam");
        layer.apply(&mut first, &[view("cam", true)], "host", "local");

        // Sender detached: the transport emits an empty video section.
        let mut muted = TransportDescription {
            version: 2,
            sections: vec![MediaSection::new(MediaKind::Video, "1")],
        };
        layer.apply(&mut muted, &[view("cam", false)], "host", "local");

        let section = muted.section(MediaKind::Video).unwrap();
        assert_eq!(section.source_by_track("cam").unwrap().ssrc, 100);
        assert_eq!(section.rtx_of(100), Some(101));
    }

    #[test]
    fn mute_before_first_attach_allocates_once() {
        let mut layer = SsrcConsistencyLayer::new();
        let mut muted = TransportDescription {
            version: 1,
            sections: vec![MediaSection::new(MediaKind::Video, "1")],
        };
        layer.apply(&mut muted, &[view("cam", false)], "host", "local");
        let memo = layer.memo(&"cam".into()).unwrap();
        assert!(memo.rtx.is_some());

        // Unmute: transport assigns an arbitrary pair, rewritten to the memo.
        let mut unmuted = desc_with_video(900, 901, "cam");
        layer.apply(&mut unmuted, &[view("cam", true)], "host", "local");
        let section = unmuted.section(MediaKind::Video).unwrap();
        assert_eq!(section.source_by_track("cam").unwrap().ssrc, memo.primary);
    }

    #[test]
    fn transfer_moves_identity_to_replacement() {
        let mut layer = SsrcConsistencyLayer::new();
        let mut first = desc_with_video(100, 101, "cam-a");
        layer.apply(&mut first, &[view("cam-a", true)], "host", "local");

        layer.transfer(&"cam-a".into(), "cam-b".into());
        assert!(layer.memo(&"cam-a".into()).is_none());
        assert_eq!(layer.memo(&"cam-b".into()).unwrap().primary, 100);
    }
}
