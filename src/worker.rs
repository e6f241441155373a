//! Background request worker.
//!
//! A [`HistoryWorker`] owns a small thread pool that executes requests
//! against a shared [`EditHistory`]. Callers talk to it through a cloneable
//! [`HistoryClient`]; every request carries its own reply channel, and a
//! caller that hears nothing back within the request timeout gets an
//! [`HistoryError::OperationTimeout`].

use crate::error::{HistoryError, Result};
use crate::history::EditHistory;
use crate::types::{
    EditId, IntegrityCheckResult, NoteId, PreviousContext, Reconstruction, StoredEdit,
    VerifyOptions,
};
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

type Reply<T> = Sender<Result<T>>;

/// A unit of work for the worker pool.
pub enum Request {
    PreviousContext {
        note_id: NoteId,
        branch: String,
        reply: Reply<Option<PreviousContext>>,
    },
    StoreEdit {
        note_id: NoteId,
        branch: String,
        content: String,
        previous_edit_id: Option<EditId>,
        reply: Reply<StoredEdit>,
    },
    Reconstruct {
        note_id: NoteId,
        branch: String,
        edit_id: EditId,
        reply: Reply<Reconstruction>,
    },
    VerifyEdit {
        note_id: NoteId,
        branch: String,
        edit_id: EditId,
        options: VerifyOptions,
        reply: Reply<IntegrityCheckResult>,
    },
    VerifyBranch {
        note_id: NoteId,
        branch: String,
        options: VerifyOptions,
        reply: Reply<Vec<IntegrityCheckResult>>,
    },
    VerifyAllBranches {
        note_id: NoteId,
        options: VerifyOptions,
        reply: Reply<Vec<IntegrityCheckResult>>,
    },
    ClearForNote {
        note_id: NoteId,
        reply: Reply<usize>,
    },
    ClearAll {
        reply: Reply<usize>,
    },
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::PreviousContext { .. } => "previous_context",
            Request::StoreEdit { .. } => "store_edit",
            Request::Reconstruct { .. } => "reconstruct",
            Request::VerifyEdit { .. } => "verify_edit",
            Request::VerifyBranch { .. } => "verify_branch",
            Request::VerifyAllBranches { .. } => "verify_all_branches",
            Request::ClearForNote { .. } => "clear_for_note",
            Request::ClearAll { .. } => "clear_all",
        }
    }

    fn execute(self, history: &EditHistory) {
        // A caller that timed out has dropped its receiver; the send fails
        // and the result is discarded.
        match self {
            Request::PreviousContext {
                note_id,
                branch,
                reply,
            } => {
                let _ = reply.send(history.get_previous_context(&note_id, &branch));
            }
            Request::StoreEdit {
                note_id,
                branch,
                content,
                previous_edit_id,
                reply,
            } => {
                let _ = reply.send(history.store_edit(&note_id, &branch, content, previous_edit_id));
            }
            Request::Reconstruct {
                note_id,
                branch,
                edit_id,
                reply,
            } => {
                let _ = reply.send(history.reconstruct(&note_id, &branch, &edit_id));
            }
            Request::VerifyEdit {
                note_id,
                branch,
                edit_id,
                options,
                reply,
            } => {
                let _ = reply.send(history.verify_edit(&note_id, &branch, &edit_id, options));
            }
            Request::VerifyBranch {
                note_id,
                branch,
                options,
                reply,
            } => {
                let _ = reply.send(history.verify_branch(&note_id, &branch, options));
            }
            Request::VerifyAllBranches {
                note_id,
                options,
                reply,
            } => {
                let _ = reply.send(history.verify_all_branches(&note_id, options));
            }
            Request::ClearForNote { note_id, reply } => {
                let _ = reply.send(history.clear_for_note(&note_id));
            }
            Request::ClearAll { reply } => {
                let _ = reply.send(history.clear_all());
            }
        }
    }
}

/// Thread pool serving [`Request`]s.
pub struct HistoryWorker {
    sender: Sender<Request>,
    shutdown: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
    timeout: Duration,
}

impl HistoryWorker {
    /// Start `threads` workers (the configured count when `None`).
    pub fn spawn(history: Arc<EditHistory>, threads: Option<usize>) -> Result<Self> {
        let threads = threads.unwrap_or(history.config().worker_threads).max(1);
        let timeout = history.config().request_timeout();
        let (sender, receiver) = unbounded::<Request>();
        let (shutdown, stopped) = bounded::<()>(0);

        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let history = history.clone();
            let receiver = receiver.clone();
            let stopped = stopped.clone();
            let handle = thread::Builder::new()
                .name(format!("edit-history-{index}"))
                .spawn(move || serve(history, receiver, stopped))?;
            handles.push(handle);
        }
        debug!(threads, "history worker started");

        Ok(Self {
            sender,
            shutdown: Some(shutdown),
            handles,
            timeout,
        })
    }

    pub fn client(&self) -> HistoryClient {
        HistoryClient {
            sender: self.sender.clone(),
            timeout: self.timeout,
        }
    }

    /// Stop the threads and join them. Requests still queued are dropped and
    /// their callers see [`HistoryError::ConnectionClosed`].
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.shutdown.take().is_none() {
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("history worker thread panicked");
            }
        }
    }
}

impl Drop for HistoryWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(history: Arc<EditHistory>, requests: Receiver<Request>, stopped: Receiver<()>) {
    loop {
        select! {
            recv(requests) -> request => match request {
                Ok(request) => {
                    debug!(request = request.name(), "handling request");
                    request.execute(&history);
                }
                Err(_) => break,
            },
            // Disconnects when the worker is shut down.
            recv(stopped) -> _ => break,
        }
    }
}

/// Cloneable handle for submitting requests to a [`HistoryWorker`].
#[derive(Clone)]
pub struct HistoryClient {
    sender: Sender<Request>,
    timeout: Duration,
}

impl HistoryClient {
    /// Override the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn call<T>(&self, operation: &str, make: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, response) = bounded(1);
        self.sender
            .send(make(reply))
            .map_err(|_| HistoryError::ConnectionClosed)?;
        match response.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(HistoryError::OperationTimeout {
                operation: operation.to_string(),
                after: self.timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(HistoryError::ConnectionClosed),
        }
    }

    pub fn get_previous_context(
        &self,
        note_id: NoteId,
        branch: impl Into<String>,
    ) -> Result<Option<PreviousContext>> {
        let branch = branch.into();
        self.call("previous_context", |reply| Request::PreviousContext {
            note_id,
            branch,
            reply,
        })
    }

    pub fn store_edit(
        &self,
        note_id: NoteId,
        branch: impl Into<String>,
        content: String,
        previous_edit_id: Option<EditId>,
    ) -> Result<StoredEdit> {
        let branch = branch.into();
        self.call("store_edit", |reply| Request::StoreEdit {
            note_id,
            branch,
            content,
            previous_edit_id,
            reply,
        })
    }

    pub fn reconstruct(
        &self,
        note_id: NoteId,
        branch: impl Into<String>,
        edit_id: EditId,
    ) -> Result<Reconstruction> {
        let branch = branch.into();
        self.call("reconstruct", |reply| Request::Reconstruct {
            note_id,
            branch,
            edit_id,
            reply,
        })
    }

    pub fn verify_edit(
        &self,
        note_id: NoteId,
        branch: impl Into<String>,
        edit_id: EditId,
        options: VerifyOptions,
    ) -> Result<IntegrityCheckResult> {
        let branch = branch.into();
        self.call("verify_edit", |reply| Request::VerifyEdit {
            note_id,
            branch,
            edit_id,
            options,
            reply,
        })
    }

    pub fn verify_branch(
        &self,
        note_id: NoteId,
        branch: impl Into<String>,
        options: VerifyOptions,
    ) -> Result<Vec<IntegrityCheckResult>> {
        let branch = branch.into();
        self.call("verify_branch", |reply| Request::VerifyBranch {
            note_id,
            branch,
            options,
            reply,
        })
    }

    pub fn verify_all_branches(
        &self,
        note_id: NoteId,
        options: VerifyOptions,
    ) -> Result<Vec<IntegrityCheckResult>> {
        self.call("verify_all_branches", |reply| Request::VerifyAllBranches {
            note_id,
            options,
            reply,
        })
    }

    pub fn clear_for_note(&self, note_id: NoteId) -> Result<usize> {
        self.call("clear_for_note", |reply| Request::ClearForNote { note_id, reply })
    }

    pub fn clear_all(&self) -> Result<usize> {
        self.call("clear_all", |reply| Request::ClearAll { reply })
    }
}
