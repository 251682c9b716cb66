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

//! Ordered task queue: submitted futures run one at a time, in submission
//! order. The next task does not start until the previous one settled, which
//! is what keeps renegotiations on a single session from racing.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{EngineError, EngineResult};

pub struct TaskQueue {
    label: String,
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("label", &self.label).finish()
    }
}

impl TaskQueue {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn({
            let label = label.clone();
            async move {
                while let Some(task) = rx.recv().await {
                    task.await;
                }
                log::debug!("task queue {} drained", label);
            }
        });
        Self { label, tx }
    }

    /// Enqueues `fut` and waits for its result. Tasks submitted earlier are
    /// guaranteed to have settled before `fut` starts.
    pub async fn run<T, F>(&self, fut: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let task = async move {
            let _ = done_tx.send(fut.await);
        }
        .boxed();

        self.tx
            .send(task)
            .map_err(|_| EngineError::Internal(format!("task queue {} closed", self.label)))?;
        done_rx
            .await
            .map_err(|_| EngineError::Internal(format!("task queue {} dropped task", self.label)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_run_strictly_in_order() {
        let queue = Arc::new(TaskQueue::new("test"));
        let running = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = queue.clone();
            let running = running.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(async move {
                        assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        order.lock().push(i);
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
            // Yield so submission order is deterministic.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn run_returns_task_output() {
        let queue = TaskQueue::new("test");
        let out = queue.run(async { 41 + 1 }).await.unwrap();
        assert_eq!(out, 42);
    }
}
