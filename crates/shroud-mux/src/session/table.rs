//! Stream table guarded by the session's table lock

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

use shroud_protocol::StreamId;

use crate::stream::Stream;

/// Everything the table lock protects: the live streams and the pending
/// idle check armed when the table last became empty
#[derive(Default)]
pub(crate) struct StreamTable {
    pub(crate) streams: HashMap<StreamId, Arc<Stream>>,
    pub(crate) idle_check: Option<JoinHandle<()>>,
}

impl StreamTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replace the pending idle check, cancelling the one it supersedes
    pub(crate) fn replace_idle_check(&mut self, check: JoinHandle<()>) {
        if let Some(previous) = self.idle_check.replace(check) {
            previous.abort();
        }
    }

    /// Cancel the pending idle check, if any
    pub(crate) fn cancel_idle_check(&mut self) {
        if let Some(check) = self.idle_check.take() {
            check.abort();
        }
    }

    /// Idle checks that have not fired yet
    pub(crate) fn pending_idle_checks(&self) -> usize {
        self.idle_check
            .as_ref()
            .map_or(0, |check| usize::from(!check.is_finished()))
    }
}
