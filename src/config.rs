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

use std::time::Duration;

/// Top-level policy configuration for a conference.
///
/// The "correct" values for the timing knobs are deployment-dependent,
/// so they are all exposed here instead of being hard-coded.
#[derive(Debug, Clone, Default)]
pub struct ConferenceConfig {
    pub p2p: P2pConfig,
    pub ice: IceRecoveryConfig,
    pub channel_retry: RetryConfig,
    pub video: VideoConfig,
}

#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Whether peer-to-peer mode may be used at all.
    pub enabled: bool,
    /// Delay before entering peer-to-peer mode once the participant count
    /// drops to two, to avoid flapping on rapid leave/rejoin.
    pub debounce: Duration,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self { enabled: true, debounce: Duration::from_secs(1) }
    }
}

#[derive(Debug, Clone)]
pub struct IceRecoveryConfig {
    /// When true, an ICE failure triggers a coordinated ICE restart instead
    /// of the grace-period countdown.
    pub auto_restart: bool,
    /// How long to tolerate an ICE failure before surfacing it as fatal.
    pub grace_period: Duration,
}

impl Default for IceRecoveryConfig {
    fn default() -> Self {
        Self { auto_restart: false, grace_period: Duration::from_secs(15) }
    }
}

/// Bounded retry with jittered exponential backoff, used by the relay
/// control channel.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, e.g. 0.25 for +/-25%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.25,
        }
    }
}

/// A single simulcast layer: resolution divisor and an independent bitrate cap.
#[derive(Debug, Clone)]
pub struct VideoLayer {
    pub rid: &'static str,
    pub scale_down_by: f64,
    pub height: u32,
    pub max_bitrate: u64,
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub simulcast: bool,
    /// Fixed encoding ladder, low to high. Collapsed to the last entry when
    /// simulcast is disabled.
    pub ladder: Vec<VideoLayer>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            simulcast: true,
            ladder: vec![
                VideoLayer { rid: "q", scale_down_by: 4.0, height: 180, max_bitrate: 200_000 },
                VideoLayer { rid: "h", scale_down_by: 2.0, height: 360, max_bitrate: 700_000 },
                VideoLayer { rid: "f", scale_down_by: 1.0, height: 720, max_bitrate: 2_500_000 },
            ],
        }
    }
}
