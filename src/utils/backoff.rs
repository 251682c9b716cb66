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

use rand::Rng;

use crate::config::RetryConfig;

/// Jittered exponential backoff. The jitter avoids thundering-herd
/// reconnection after a shared network event.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self { base: config.base_delay, max: config.max_delay, jitter: config.jitter, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        capped.mul_f64(factor.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_stay_within_jitter_bounds() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: 0.25,
        };
        let mut backoff = Backoff::new(&config);

        for attempt in 0..8u32 {
            let ideal =
                Duration::from_millis(100).saturating_mul(1 << attempt).min(Duration::from_secs(2));
            let delay = backoff.next_delay();
            assert!(delay >= ideal.mul_f64(0.75), "attempt {}: {:?} too short", attempt, delay);
            assert!(delay <= ideal.mul_f64(1.25), "attempt {}: {:?} too long", attempt, delay);
        }
        assert_eq!(backoff.attempt(), 8);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        };
        let mut backoff = Backoff::new(&config);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
    }
}
