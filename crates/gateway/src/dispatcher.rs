//! Funnels every remote session onto the one shared DOM-control connection.
//!
//! A single worker task owns all kernels and runs jobs in submission order,
//! so attachment switches between sessions are serialized. Callers wait on a
//! pending entry keyed by `(session, correlation id)`; an entry that times
//! out is evicted, and whatever the worker produces for it later is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use domshell_core::{DomControl, Error, Result};
use domshell_shell::{Command, Kernel, Reply};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

type PendingKey = (String, String);

/// One outstanding remote command.
pub struct PendingCommand {
    pub correlation_id: String,
    pub submitted_at: Instant,
    pub deadline: Instant,
    done: oneshot::Sender<Reply>,
}

enum Job {
    Run {
        session_id: String,
        correlation_id: String,
        command: Command,
    },
    PageUrl {
        session_id: String,
        command: Command,
        reply_tx: oneshot::Sender<Result<Option<String>>>,
    },
    Close {
        session_id: String,
    },
}

#[derive(Clone)]
pub struct Dispatcher {
    job_tx: mpsc::Sender<Job>,
    pending: Arc<Mutex<HashMap<PendingKey, PendingCommand>>>,
}

impl Dispatcher {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn spawn(control: Arc<dyn DomControl>) -> Self {
        let (job_tx, job_rx) = mpsc::channel(64);
        let pending = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(run_worker(control, job_rx, pending.clone()));
        Self { job_tx, pending }
    }

    /// Queue `command` for `session_id` and wait at most `timeout` for it.
    pub async fn submit(
        &self,
        session_id: &str,
        correlation_id: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<Reply> {
        let key = (session_id.to_string(), correlation_id.to_string());
        let (done, done_rx) = oneshot::channel();
        let now = Instant::now();
        self.pending.lock().await.insert(
            key.clone(),
            PendingCommand {
                correlation_id: correlation_id.to_string(),
                submitted_at: now,
                deadline: now + timeout,
                done,
            },
        );

        let job = Job::Run {
            session_id: session_id.to_string(),
            correlation_id: correlation_id.to_string(),
            command,
        };
        if self.job_tx.send(job).await.is_err() {
            self.pending.lock().await.remove(&key);
            return Err(Error::Control("command dispatcher stopped".into()));
        }

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Control("command dispatcher dropped the request".into())),
            Err(_) => {
                if let Some(evicted) = self.pending.lock().await.remove(&key) {
                    warn!(
                        session = %session_id,
                        correlation = %evicted.correlation_id,
                        waited_ms = evicted.submitted_at.elapsed().as_millis() as u64,
                        "Command timed out, evicted"
                    );
                }
                Err(Error::CommandTimeout(format!(
                    "no result within {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// URL of the page `command` would act on for this session, without
    /// running it. `None` when the command touches no page.
    pub async fn page_url(
        &self,
        session_id: &str,
        command: &Command,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job::PageUrl {
            session_id: session_id.to_string(),
            command: command.clone(),
            reply_tx,
        };
        self.job_tx
            .send(job)
            .await
            .map_err(|_| Error::Control("command dispatcher stopped".into()))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Control("command dispatcher dropped the request".into())),
            Err(_) => Err(Error::CommandTimeout("resolving the target page URL".into())),
        }
    }

    /// Drop the session's kernel. Queued commands of that session still run first.
    pub async fn close(&self, session_id: &str) {
        let job = Job::Close {
            session_id: session_id.to_string(),
        };
        if self.job_tx.send(job).await.is_err() {
            debug!(session = %session_id, "dispatcher stopped before close");
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

async fn run_worker(
    control: Arc<dyn DomControl>,
    mut job_rx: mpsc::Receiver<Job>,
    pending: Arc<Mutex<HashMap<PendingKey, PendingCommand>>>,
) {
    let mut kernels: HashMap<String, Kernel> = HashMap::new();

    while let Some(job) = job_rx.recv().await {
        match job {
            Job::Run {
                session_id,
                correlation_id,
                command,
            } => {
                let key = (session_id.clone(), correlation_id.clone());
                let expired = match pending.lock().await.get(&key) {
                    None => true,
                    Some(entry) => entry.deadline <= Instant::now(),
                };
                if expired {
                    debug!(session = %session_id, correlation = %correlation_id, "Skipping command evicted before it started");
                    continue;
                }

                let kernel = kernels
                    .entry(session_id.clone())
                    .or_insert_with(|| Kernel::new(control.clone()));
                let reply = kernel.run(command).await;

                match pending.lock().await.remove(&key) {
                    Some(entry) => {
                        let _ = entry.done.send(reply);
                    }
                    None => {
                        debug!(session = %session_id, correlation = %correlation_id, "Discarding late result");
                    }
                }
            }
            Job::PageUrl {
                session_id,
                command,
                reply_tx,
            } => {
                let kernel = kernels
                    .entry(session_id)
                    .or_insert_with(|| Kernel::new(control.clone()));
                let _ = reply_tx.send(kernel.page_url_for(&command).await);
            }
            Job::Close { session_id } => {
                if kernels.remove(&session_id).is_some() {
                    info!(session = %session_id, "Session kernel dropped");
                }
            }
        }
    }
    debug!("dispatcher worker stopped");
}
