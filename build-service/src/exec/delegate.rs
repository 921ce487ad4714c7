// Step Delegates
// Where a put step reports its output and outcome

use super::{ExecError, ExitStatus, VersionInfo};
use crate::db::BuildId;
use crate::events::{BuildEvent, EventSender, ProgressSender};
use crate::resource::OutputSink;

use std::sync::Arc;
use tracing::{error, info};

/// Receives a put step's progress
pub trait PutDelegate: Send + Sync {
    fn stdout(&self) -> Option<OutputSink>;

    fn stderr(&self) -> Option<OutputSink>;

    /// The step is about to acquire its container
    fn initializing(&self);

    /// The script ran to completion; `info` is only present for a zero exit status
    fn completed(&self, status: ExitStatus, info: Option<&VersionInfo>);

    /// The step could not complete
    fn failed(&self, err: &ExecError);
}

/// Delegate forwarding to the progress channel and the log
pub struct EventDelegate {
    build_id: BuildId,
    step_name: String,
    event_tx: Option<ProgressSender>,
}

impl EventDelegate {
    pub fn new(build_id: BuildId, step_name: impl Into<String>, event_tx: Option<ProgressSender>) -> Self {
        Self {
            build_id,
            step_name: step_name.into(),
            event_tx,
        }
    }

    fn sink(&self, is_error: bool) -> Option<OutputSink> {
        let tx = self.event_tx.clone()?;
        let build_id = self.build_id;
        let step_name = self.step_name.clone();
        Some(Arc::new(move |line: &str| {
            tx.send_event(BuildEvent::step_output(build_id, step_name.as_str(), line, is_error));
        }))
    }
}

impl PutDelegate for EventDelegate {
    fn stdout(&self) -> Option<OutputSink> {
        self.sink(false)
    }

    fn stderr(&self) -> Option<OutputSink> {
        self.sink(true)
    }

    fn initializing(&self) {
        self.event_tx
            .send_event(BuildEvent::step_started(self.build_id, self.step_name.as_str()));
    }

    fn completed(&self, status: ExitStatus, info: Option<&VersionInfo>) {
        info!(build_id = %self.build_id, step = %self.step_name, exit_status = status.0, "put completed");
        self.event_tx.send_event(BuildEvent::step_completed(
            self.build_id,
            self.step_name.as_str(),
            status,
            info.cloned(),
        ));
    }

    fn failed(&self, err: &ExecError) {
        error!(build_id = %self.build_id, step = %self.step_name, error = %err, "put failed");
        self.event_tx.send_event(BuildEvent::step_errored(
            self.build_id,
            self.step_name.as_str(),
            err.to_string(),
        ));
    }
}
