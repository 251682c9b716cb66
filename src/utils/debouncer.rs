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

//! Cancellable delayed execution. The wrapped future runs once the delay
//! elapses without a reset; dropping or cancelling the handle prevents it
//! from running at all.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

pub struct Debouncer {
    reset_tx: mpsc::UnboundedSender<()>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub fn debounce<F>(delay: Duration, future: F) -> Debouncer
where
    F: Future + Send + 'static,
{
    let (reset_tx, reset_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(wait_and_fire(delay, future, reset_rx, cancel_rx));
    Debouncer { reset_tx, cancel_tx: Some(cancel_tx) }
}

async fn wait_and_fire<F>(
    delay: Duration,
    future: F,
    mut reset_rx: mpsc::UnboundedReceiver<()>,
    mut cancel_rx: oneshot::Receiver<()>,
) where
    F: Future + Send + 'static,
{
    loop {
        tokio::select! {
            _ = &mut cancel_rx => break,
            Some(_) = reset_rx.recv() => continue,
            _ = tokio::time::sleep(delay) => {
                future.await;
                break;
            }
        }
    }
}

impl Debouncer {
    /// Restarts the delay. Fails if the future has already run.
    pub fn reset(&self) -> Result<(), mpsc::error::SendError<()>> {
        self.reset_tx.send(())
    }

    /// Prevents the wrapped future from running.
    pub fn cancel(mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let _debouncer = debounce(Duration::from_millis(100), {
            let fired = fired.clone();
            async move { fired.store(true, Ordering::SeqCst) }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let debouncer = debounce(Duration::from_millis(100), {
            let fired = fired.clone();
            async move { fired.store(true, Ordering::SeqCst) }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restarts_the_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let debouncer = debounce(Duration::from_millis(100), {
            let fired = fired.clone();
            async move { fired.store(true, Ordering::SeqCst) }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        debouncer.reset().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
