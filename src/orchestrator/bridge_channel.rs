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

//! Relay control channel: JSON messages to and from the media relay,
//! independent of the signaling sessions. The channel reconnects on its own
//! with bounded, jittered backoff, and messages sent while it is down are
//! queued and flushed once it comes back.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::config::RetryConfig;
use crate::errors::{EngineError, EngineResult};
use crate::id::ParticipantId;
use crate::utils::backoff::Backoff;

/// Wire messages, tagged by `colibriClass`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "colibriClass")]
pub enum BridgeMessage {
    #[serde(rename = "LastNChangedEvent")]
    LastNChanged {
        #[serde(rename = "lastN")]
        last_n: i32,
    },
    #[serde(rename = "PinnedEndpointChangedEvent")]
    PinnedEndpointChanged {
        #[serde(rename = "pinnedEndpoint")]
        pinned_endpoint: String,
    },
    #[serde(rename = "SelectedEndpointsChangedEvent")]
    SelectedEndpointsChanged {
        #[serde(rename = "selectedEndpoints")]
        selected_endpoints: Vec<String>,
    },
    #[serde(rename = "ReceiverVideoConstraint")]
    ReceiverVideoConstraint {
        #[serde(rename = "maxFrameHeight")]
        max_frame_height: u32,
    },
    #[serde(rename = "SenderVideoConstraints")]
    SenderVideoConstraints {
        #[serde(rename = "videoConstraints")]
        video_constraints: SenderConstraints,
    },
    #[serde(rename = "LastNEndpointsChangeEvent")]
    LastNEndpointsChange {
        #[serde(rename = "lastNEndpoints")]
        last_n_endpoints: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderConstraints {
    #[serde(rename = "idealHeight")]
    pub ideal_height: u32,
}

/// Raw transport underneath the bridge channel. `rx` yielding `None` means
/// the underlying connection dropped.
pub struct ControlChannelHandle {
    pub tx: mpsc::UnboundedSender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait ControlChannelFactory: Send + Sync {
    async fn connect(&self) -> EngineResult<ControlChannelHandle>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Open,
    Closed,
    /// All reconnection attempts exhausted; the channel stays down.
    Failed,
    SenderVideoConstraints { ideal_height: u32 },
    LastNEndpointsChanged { entering: Vec<ParticipantId>, leaving: Vec<ParticipantId> },
}

pub type BridgeEmitter = mpsc::UnboundedSender<BridgeEvent>;
pub type BridgeEvents = mpsc::UnboundedReceiver<BridgeEvent>;

struct ChannelState {
    sender: Option<mpsc::UnboundedSender<String>>,
    pending: Vec<String>,
}

struct BridgeInner {
    factory: Arc<dyn ControlChannelFactory>,
    retry: RetryConfig,
    state: Mutex<ChannelState>,
    last_n_endpoints: Mutex<Vec<ParticipantId>>,
    emitter: BridgeEmitter,
}

pub struct BridgeChannel {
    inner: Arc<BridgeInner>,
    close_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for BridgeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeChannel").field("open", &self.is_open()).finish()
    }
}

impl BridgeChannel {
    pub fn new(
        factory: Arc<dyn ControlChannelFactory>,
        retry: RetryConfig,
    ) -> (Self, BridgeEvents) {
        let (emitter, events) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);

        let inner = Arc::new(BridgeInner {
            factory,
            retry,
            state: Mutex::new(ChannelState { sender: None, pending: Vec::new() }),
            last_n_endpoints: Mutex::new(Vec::new()),
            emitter,
        });
        tokio::spawn(channel_task(inner.clone(), close_rx));

        (Self { inner, close_tx }, events)
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().sender.is_some()
    }

    /// Queues `message` when the channel is down instead of failing the
    /// caller; a dropped channel is a transient condition here.
    pub fn send(&self, message: &BridgeMessage) -> EngineResult<()> {
        let text = serde_json::to_string(message)
            .map_err(|e| EngineError::Internal(format!("control message encode: {}", e)))?;

        let mut state = self.inner.state.lock();
        match &state.sender {
            Some(tx) if tx.send(text.clone()).is_ok() => Ok(()),
            _ => {
                log::debug!("control channel down, queueing message");
                state.pending.push(text);
                Ok(())
            }
        }
    }

    pub fn set_last_n(&self, last_n: i32) -> EngineResult<()> {
        self.send(&BridgeMessage::LastNChanged { last_n })
    }

    pub fn pin_endpoint(&self, endpoint: Option<&ParticipantId>) -> EngineResult<()> {
        self.send(&BridgeMessage::PinnedEndpointChanged {
            pinned_endpoint: endpoint.map(|p| p.to_string()).unwrap_or_default(),
        })
    }

    pub fn select_endpoints(&self, endpoints: &[ParticipantId]) -> EngineResult<()> {
        self.send(&BridgeMessage::SelectedEndpointsChanged {
            selected_endpoints: endpoints.iter().map(|p| p.to_string()).collect(),
        })
    }

    pub fn set_receiver_video_constraint(&self, max_frame_height: u32) -> EngineResult<()> {
        self.send(&BridgeMessage::ReceiverVideoConstraint { max_frame_height })
    }

    pub fn close(&self) {
        let _ = self.close_tx.send(true);
        self.inner.state.lock().sender = None;
    }
}

impl Drop for BridgeChannel {
    fn drop(&mut self) {
        let _ = self.close_tx.send(true);
    }
}

impl BridgeInner {
    fn handle_inbound(&self, text: &str) {
        let message: BridgeMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("ignoring malformed control message: {}", err);
                return;
            }
        };
        match message {
            BridgeMessage::SenderVideoConstraints { video_constraints } => {
                let _ = self.emitter.send(BridgeEvent::SenderVideoConstraints {
                    ideal_height: video_constraints.ideal_height,
                });
            }
            BridgeMessage::LastNEndpointsChange { last_n_endpoints } => {
                let current: Vec<ParticipantId> =
                    last_n_endpoints.iter().map(|e| ParticipantId::from(e.clone())).collect();
                let previous = {
                    let mut held = self.last_n_endpoints.lock();
                    std::mem::replace(&mut *held, current.clone())
                };
                let entering: Vec<ParticipantId> =
                    current.iter().filter(|p| !previous.contains(p)).cloned().collect();
                let leaving: Vec<ParticipantId> =
                    previous.iter().filter(|p| !current.contains(p)).cloned().collect();
                if !entering.is_empty() || !leaving.is_empty() {
                    let _ =
                        self.emitter.send(BridgeEvent::LastNEndpointsChanged { entering, leaving });
                }
            }
            other => {
                log::debug!("ignoring unexpected inbound control message: {:?}", other);
            }
        }
    }
}

async fn channel_task(inner: Arc<BridgeInner>, mut close_rx: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(&inner.retry);
    loop {
        let handle = tokio::select! {
            _ = close_rx.changed() => return,
            result = inner.factory.connect() => match result {
                Ok(handle) => handle,
                Err(err) => {
                    if backoff.attempt() + 1 >= inner.retry.max_attempts {
                        log::error!("control channel gave up after {} attempts: {}",
                            inner.retry.max_attempts, err);
                        let _ = inner.emitter.send(BridgeEvent::Failed);
                        return;
                    }
                    let delay = backoff.next_delay();
                    log::warn!("control channel connect failed ({}), retrying in {:?}", err, delay);
                    tokio::select! {
                        _ = close_rx.changed() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            }
        };

        backoff.reset();
        {
            let mut state = inner.state.lock();
            for text in state.pending.drain(..) {
                let _ = handle.tx.send(text);
            }
            state.sender = Some(handle.tx.clone());
        }
        let _ = inner.emitter.send(BridgeEvent::Open);
        log::info!("control channel open");

        let mut rx = handle.rx;
        loop {
            tokio::select! {
                _ = close_rx.changed() => {
                    inner.state.lock().sender = None;
                    return;
                }
                message = rx.recv() => match message {
                    Some(text) => inner.handle_inbound(&text),
                    None => break,
                }
            }
        }

        inner.state.lock().sender = None;
        let _ = inner.emitter.send(BridgeEvent::Closed);
        log::warn!("control channel dropped, reconnecting");
    }
}
