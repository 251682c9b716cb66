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

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed or out-of-state offer/answer.
    #[error("negotiation failure: {0}")]
    Negotiation(String),
    /// The transport refused a local or remote description.
    #[error("transport rejected description: {0}")]
    DescriptionRejected(String),
    /// Connectivity lost with no path to recovery.
    #[error("ice connectivity failed")]
    IceFailed,
    /// The relay control channel is not open.
    #[error("control channel unavailable")]
    ChannelUnavailable,
    /// An operation was attempted in a state that doesn't allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("internal error: {0}")]
    Internal(String),
}
