//! Parallel bulk loader
//!
//! Serialized `<doc>` fragments are pushed on a shared FIFO queue. Each
//! worker keeps one streamed update request open whose body pulls from that
//! queue until the loader is finished. Idle bodies are fed a blank line
//! every keepalive period so the server does not drop the connection.
//!
//! With one worker the server receives fragments in push order. With more,
//! only fragments taken by the same worker keep their relative order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;

use crate::error::{Result, SolrError};
use crate::transport::{FragmentStream, Transport, Upload, XML_CONTENT_TYPE};

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(5);

const KEEPALIVE_SEPARATOR: &[u8] = b"\n";

/// Outcome of one pull from the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Pulled {
    Fragment(String),
    /// Nothing arrived within the keepalive period.
    Idle,
    /// Every sender is gone and the queue is empty.
    Closed,
}

/// Consumer side of the fragment channel, shared by every worker. Keeps a
/// count of fragments pushed but not yet acknowledged with `task_done`.
#[derive(Debug)]
pub struct UploadQueue {
    rx: Mutex<UnboundedReceiver<String>>,
    pending: AtomicUsize,
    drained: Notify,
}

/// Producer side. Dropping the last sender closes the queue.
#[derive(Clone, Debug)]
pub struct UploadSender {
    tx: UnboundedSender<String>,
    queue: Arc<UploadQueue>,
}

impl UploadQueue {
    pub fn channel() -> (UploadSender, Arc<UploadQueue>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(UploadQueue {
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
        });
        let sender = UploadSender {
            tx,
            queue: Arc::clone(&queue),
        };
        (sender, queue)
    }

    /// Take the next fragment, waiting at most `keepalive` for one.
    pub async fn pull(&self, keepalive: Duration) -> Pulled {
        match timeout(keepalive, async { self.rx.lock().await.recv().await }).await {
            Ok(Some(fragment)) => Pulled::Fragment(fragment),
            Ok(None) => Pulled::Closed,
            Err(_) => Pulled::Idle,
        }
    }

    /// Acknowledge one pulled fragment.
    pub fn task_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolves once every pushed fragment has been acknowledged.
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl UploadSender {
    pub fn push(&self, fragment: String) {
        self.queue.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(fragment).is_err() {
            self.queue.task_done();
        }
    }
}

struct BodyState {
    queue: Arc<UploadQueue>,
    keepalive: Duration,
    unacked: bool,
}

/// `<add>`, then fragments pulled from `queue`, then `</add>`. A fragment
/// is acknowledged when the stream is polled again, i.e. after the
/// transport has taken it.
pub(crate) fn add_body(queue: Arc<UploadQueue>, keepalive: Duration) -> FragmentStream {
    let state = BodyState {
        queue,
        keepalive,
        unacked: false,
    };
    let fragments = stream::unfold(state, |mut state| async move {
        if state.unacked {
            state.queue.task_done();
            state.unacked = false;
        }
        match state.queue.pull(state.keepalive).await {
            Pulled::Fragment(fragment) => {
                state.unacked = true;
                Some((Ok(Bytes::from(fragment)), state))
            }
            Pulled::Idle => Some((Ok(Bytes::from_static(KEEPALIVE_SEPARATOR)), state)),
            Pulled::Closed => None,
        }
    });

    Box::pin(
        stream::once(async { Ok(Bytes::from_static(b"<add>")) })
            .chain(fragments)
            .chain(stream::once(async { Ok(Bytes::from_static(b"</add>")) })),
    )
}

/// A running pool of upload workers.
pub struct BulkLoader {
    sender: Option<UploadSender>,
    queue: Arc<UploadQueue>,
    workers: JoinSet<Result<Value>>,
    endpoint: String,
}

impl BulkLoader {
    /// Open `parallel` (at least one) streamed uploads to `resource`.
    pub fn start(transport: Arc<dyn Transport>, resource: &str, parallel: usize, keepalive: Duration) -> Self {
        let (sender, queue) = UploadQueue::channel();
        let endpoint = transport.endpoint();
        let mut workers = JoinSet::new();
        for worker in 0..parallel.max(1) {
            let transport = Arc::clone(&transport);
            let body = add_body(Arc::clone(&queue), keepalive);
            let resource = resource.to_string();
            log::debug!("[{}] Starting upload worker {}", endpoint, worker);
            workers.spawn(async move {
                transport
                    .request(&resource, Vec::new(), Some(Upload::stream(body, XML_CONTENT_TYPE)))
                    .await
            });
        }
        Self {
            sender: Some(sender),
            queue,
            workers,
            endpoint,
        }
    }

    pub fn push(&self, fragment: String) {
        log::trace!("[{}] Queued: {}", self.endpoint, fragment);
        if let Some(sender) = &self.sender {
            sender.push(fragment);
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Wait until every pushed fragment is taken, stop the workers and
    /// collect their responses. The first failing worker fails the batch
    /// and the others are aborted.
    pub async fn finish(mut self) -> Result<Vec<Value>> {
        let queue = Arc::clone(&self.queue);
        let mut responses = Vec::new();

        log::debug!("[{}] Joining queue", self.endpoint);
        loop {
            tokio::select! {
                _ = queue.drained() => break,
                joined = self.workers.join_next() => match joined {
                    Some(joined) => match worker_result(joined) {
                        Ok(response) => responses.push(response),
                        Err(e) => return Err(self.fail(e)),
                    },
                    None => {
                        let pending = queue.pending();
                        if pending == 0 {
                            break;
                        }
                        return Err(self.fail(SolrError::Upload(format!(
                            "all upload workers stopped with {} fragments pending",
                            pending
                        ))));
                    }
                },
            }
        }

        self.sender = None;
        log::debug!("[{}] Queue joined", self.endpoint);
        while let Some(joined) = self.workers.join_next().await {
            match worker_result(joined) {
                Ok(response) => responses.push(response),
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(responses)
    }

    /// Tear down every worker without waiting for pending fragments.
    pub fn abort(mut self) {
        self.sender = None;
        self.workers.abort_all();
    }

    fn fail(&mut self, error: SolrError) -> SolrError {
        log::error!("[{}] Upload failed: {}", self.endpoint, error);
        self.sender = None;
        self.workers.abort_all();
        error
    }
}

fn worker_result(joined: std::result::Result<Result<Value>, JoinError>) -> Result<Value> {
    joined.map_err(|e| SolrError::Upload(format!("upload worker failed: {}", e)))?
}
