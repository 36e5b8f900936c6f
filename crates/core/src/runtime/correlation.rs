//! Correlation table multiplexing concurrent logical calls over one transport.

use dashmap::DashMap;
use tokio::sync::oneshot;

use super::cancel::CancelCell;
use super::progress::ProgressSender;
use super::protocol::{ErrorKind, ErrorPayload, JobId, Response, ResponseBody};

/// Handlers registered for one outstanding request id.
#[derive(Debug)]
pub struct PendingJob {
    reply: oneshot::Sender<Response>,
    progress: ProgressSender,
    cancel: CancelCell,
}

impl PendingJob {
    pub fn new(reply: oneshot::Sender<Response>, progress: ProgressSender, cancel: CancelCell) -> Self {
        PendingJob { reply, progress, cancel }
    }
}

/// Mapping from outstanding request id to its registered handlers.
///
/// An entry is inserted when a request is sent and removed exactly once, when
/// the terminal response for that id arrives. Responses can land while new
/// requests are being registered, hence the concurrent map.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: DashMap<JobId, PendingJob>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn register(&self, id: JobId, pending: PendingJob) {
        if self.entries.insert(id, pending).is_some() {
            // Ids are uuid-v4; a collision here means a caller bug.
            log::error!("Duplicate job id registered, previous entry dropped: {id}");
        }
    }

    /// Route a response to the handlers registered for its id.
    ///
    /// Progress keeps the entry alive; a terminal response consumes it. A
    /// response with no matching entry is dropped — defensive, not fatal.
    pub fn resolve(&self, response: Response) {
        match response.body {
            ResponseBody::Progress { value } => {
                if let Some(entry) = self.entries.get(&response.id) {
                    // The receiver half may already be dropped; fine either way.
                    let _ = entry.progress.send(value);
                } else {
                    log::debug!("Dropping progress for unknown job id: {}", response.id);
                }
            }
            _ => {
                if let Some((_, pending)) = self.entries.remove(&response.id) {
                    let _ = pending.reply.send(response);
                } else {
                    log::debug!("Dropping terminal response for unknown job id: {}", response.id);
                }
            }
        }
    }

    /// Flip the cancellation cell of every outstanding job.
    pub fn cancel_all(&self) {
        for entry in self.entries.iter() {
            entry.cancel.cancel();
        }
    }

    /// Reject every outstanding entry with a transport error. Invoked when the
    /// worker transport itself dies so no caller is left hanging.
    pub fn reject_all(&self, reason: &str) {
        let ids: Vec<JobId> = self.entries.iter().map(|e| *e.key()).collect();
        if !ids.is_empty() {
            log::warn!("Rejecting {} outstanding job(s): {reason}", ids.len());
        }
        for id in ids {
            if let Some((_, pending)) = self.entries.remove(&id) {
                let _ = pending.reply.send(Response::error(id, ErrorPayload::new(ErrorKind::Transport, reason)));
            }
        }
    }
}
