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

//! Parsed representation of an SDP-like offer/answer, independent of any
//! underlying RTC library. Only the attributes the negotiation core depends
//! on are modeled: media sections, direction, source (SSRC) declarations and
//! SSRC groups.

use std::fmt;
use std::str::FromStr;

use crate::errors::{EngineError, EngineResult};

pub mod consistency;

pub const FID_SEMANTICS: &str = "FID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl FromStr for MediaKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            other => Err(EngineError::Negotiation(format!("unknown media kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }
}

/// One `a=ssrc:` declaration group: a synchronization source with its
/// attached cname and msid (stream / track pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub ssrc: u32,
    pub cname: String,
    /// Media stream part of the msid. For remote descriptions the signaling
    /// layer writes the owning participant id here.
    pub stream: String,
    /// Track part of the msid; matches the local [`crate::id::TrackId`] for
    /// locally originated sources.
    pub track: String,
}

impl SourceInfo {
    pub fn msid(&self) -> String {
        format!("{} {}", self.stream, self.track)
    }
}

/// `a=ssrc-group:` declaration, FID (retransmission) being the only
/// semantics the core cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcGroup {
    pub semantics: String,
    pub ssrcs: Vec<u32>,
}

impl SsrcGroup {
    pub fn fid(primary: u32, rtx: u32) -> Self {
        Self { semantics: FID_SEMANTICS.to_owned(), ssrcs: vec![primary, rtx] }
    }

    pub fn is_fid(&self) -> bool {
        self.semantics == FID_SEMANTICS
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSection {
    pub kind: MediaKind,
    pub mid: String,
    pub direction: MediaDirection,
    pub sources: Vec<SourceInfo>,
    pub ssrc_groups: Vec<SsrcGroup>,
}

impl MediaSection {
    pub fn new(kind: MediaKind, mid: impl Into<String>) -> Self {
        Self {
            kind,
            mid: mid.into(),
            direction: MediaDirection::SendRecv,
            sources: Vec::new(),
            ssrc_groups: Vec::new(),
        }
    }

    pub fn source(&self, ssrc: u32) -> Option<&SourceInfo> {
        self.sources.iter().find(|s| s.ssrc == ssrc)
    }

    pub fn source_by_track(&self, track: &str) -> Option<&SourceInfo> {
        self.sources.iter().find(|s| s.track == track && !self.is_rtx(s.ssrc))
    }

    /// The retransmission companion of `primary`, if declared via FID.
    pub fn rtx_of(&self, primary: u32) -> Option<u32> {
        self.ssrc_groups
            .iter()
            .filter(|g| g.is_fid())
            .find(|g| g.ssrcs.first() == Some(&primary))
            .and_then(|g| g.ssrcs.get(1))
            .copied()
    }

    /// Whether `ssrc` is a retransmission ssrc (a non-leading member of a
    /// FID group).
    pub fn is_rtx(&self, ssrc: u32) -> bool {
        self.ssrc_groups
            .iter()
            .filter(|g| g.is_fid())
            .any(|g| g.ssrcs.iter().skip(1).any(|&s| s == ssrc))
    }

    pub fn remove_source(&mut self, ssrc: u32) {
        self.sources.retain(|s| s.ssrc != ssrc);
        self.ssrc_groups.retain(|g| !g.ssrcs.contains(&ssrc));
    }

    /// Rewrites every occurrence of `old` (sources and groups) to `new`.
    pub fn rewrite_ssrc(&mut self, old: u32, new: u32) {
        if old == new {
            return;
        }
        for source in &mut self.sources {
            if source.ssrc == old {
                source.ssrc = new;
            }
        }
        for group in &mut self.ssrc_groups {
            for ssrc in &mut group.ssrcs {
                if *ssrc == old {
                    *ssrc = new;
                }
            }
        }
    }
}

/// A full transport description (offer or answer).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportDescription {
    pub version: u64,
    pub sections: Vec<MediaSection>,
}

impl TransportDescription {
    pub fn section(&self, kind: MediaKind) -> Option<&MediaSection> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    pub fn section_mut(&mut self, kind: MediaKind) -> Option<&mut MediaSection> {
        self.sections.iter_mut().find(|s| s.kind == kind)
    }

    pub fn ssrcs(&self) -> Vec<u32> {
        self.sections.iter().flat_map(|s| s.sources.iter().map(|src| src.ssrc)).collect()
    }

    pub fn parse(input: &str) -> EngineResult<Self> {
        let mut desc = TransportDescription::default();
        for (lineno, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let err = |msg: &str| {
                EngineError::Negotiation(format!("line {}: {}: {:?}", lineno + 1, msg, line))
            };

            if let Some(version) = line.strip_prefix("v=") {
                desc.version = version.parse().map_err(|_| err("bad version"))?;
            } else if let Some(kind) = line.strip_prefix("m=") {
                let kind = kind.parse::<MediaKind>()?;
                desc.sections.push(MediaSection::new(kind, desc.sections.len().to_string()));
            } else if let Some(attr) = line.strip_prefix("a=") {
                let section = desc
                    .sections
                    .last_mut()
                    .ok_or_else(|| err("attribute outside media section"))?;
                if let Some(mid) = attr.strip_prefix("mid:") {
                    section.mid = mid.to_owned();
                } else if let Some(direction) = MediaDirection::parse(attr) {
                    section.direction = direction;
                } else if let Some(group) = attr.strip_prefix("ssrc-group:") {
                    let mut parts = group.split_whitespace();
                    let semantics =
                        parts.next().ok_or_else(|| err("empty ssrc-group"))?.to_owned();
                    let ssrcs = parts
                        .map(|p| p.parse::<u32>().map_err(|_| err("bad ssrc in group")))
                        .collect::<EngineResult<Vec<_>>>()?;
                    section.ssrc_groups.push(SsrcGroup { semantics, ssrcs });
                } else if let Some(rest) = attr.strip_prefix("ssrc:") {
                    let (ssrc, rest) =
                        rest.split_once(' ').ok_or_else(|| err("bad ssrc attribute"))?;
                    let ssrc = ssrc.parse::<u32>().map_err(|_| err("bad ssrc"))?;
                    let idx = match section.sources.iter().position(|s| s.ssrc == ssrc) {
                        Some(idx) => idx,
                        None => {
                            section.sources.push(SourceInfo {
                                ssrc,
                                cname: String::new(),
                                stream: String::new(),
                                track: String::new(),
                            });
                            section.sources.len() - 1
                        }
                    };
                    let source = &mut section.sources[idx];
                    if let Some(cname) = rest.strip_prefix("cname:") {
                        source.cname = cname.to_owned();
                    } else if let Some(msid) = rest.strip_prefix("msid:") {
                        let (stream, track) = msid.split_once(' ').unwrap_or((msid, ""));
                        source.stream = stream.to_owned();
                        source.track = track.to_owned();
                    }
                    // Other ssrc attributes are irrelevant to negotiation.
                }
                // Unknown attributes are ignored rather than rejected.
            } else {
                return Err(err("unknown line"));
            }
        }
        Ok(desc)
    }
}

impl fmt::Display for TransportDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "v={}", self.version)?;
        for section in &self.sections {
            writeln!(f, "m={}", section.kind.as_str())?;
            writeln!(f, "a=mid:{}", section.mid)?;
            writeln!(f, "a={}", section.direction.as_str())?;
            for group in &section.ssrc_groups {
                write!(f, "a=ssrc-group:{}", group.semantics)?;
                for ssrc in &group.ssrcs {
                    write!(f, " {}", ssrc)?;
                }
                writeln!(f)?;
            }
            for source in &section.sources {
                writeln!(f, "a=ssrc:{} cname:{}", source.ssrc, source.cname)?;
                writeln!(f, "a=ssrc:{} msid:{}", source.ssrc, source.msid())?;
            }
        }
        Ok(())
    }
}

/// Source declarations for one media kind, the unit of `source-add` /
/// `source-remove` signaling.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceUpdate {
    pub kind: MediaKind,
    pub sources: Vec<SourceInfo>,
    pub ssrc_groups: Vec<SsrcGroup>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceDiff {
    pub added: Vec<SourceUpdate>,
    pub removed: Vec<SourceUpdate>,
}

impl SourceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Diffs the SSRC/SSRC-group declarations of two descriptions, yielding only
/// the changed source declarations. Everything except sources is ignored,
/// which is what lets a mute toggle produce an empty diff.
pub fn source_diff(old: &TransportDescription, new: &TransportDescription) -> SourceDiff {
    let mut diff = SourceDiff::default();

    for kind in [MediaKind::Audio, MediaKind::Video] {
        let old_section = old.section(kind);
        let new_section = new.section(kind);

        let added = delta_sources(new_section, old_section);
        if let Some(update) = added {
            diff.added.push(update);
        }
        let removed = delta_sources(old_section, new_section);
        if let Some(update) = removed {
            diff.removed.push(update);
        }
    }

    diff
}

/// Sources present in `a` but not in `b`, with the groups that reference
/// them.
fn delta_sources(a: Option<&MediaSection>, b: Option<&MediaSection>) -> Option<SourceUpdate> {
    let a = a?;
    let sources: Vec<SourceInfo> = a
        .sources
        .iter()
        .filter(|s| b.map_or(true, |b| b.source(s.ssrc).is_none()))
        .cloned()
        .collect();
    if sources.is_empty() {
        return None;
    }
    let ssrc_groups = a
        .ssrc_groups
        .iter()
        .filter(|g| g.ssrcs.iter().any(|ssrc| sources.iter().any(|s| s.ssrc == *ssrc)))
        .cloned()
        .collect();
    Some(SourceUpdate { kind: a.kind, sources, ssrc_groups })
}
