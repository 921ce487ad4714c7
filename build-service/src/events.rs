// Build Events
// Observability events emitted while builds are tracked and steps run

use crate::db::{BuildId, BuildRecord, BuildStatus};
use crate::exec::{ExitStatus, VersionInfo};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for build progress events
pub type ProgressSender = mpsc::UnboundedSender<BuildEvent>;

/// Receiver for build progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<BuildEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Pipeline/job/build identity carried by lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLabels {
    pub build_id: BuildId,
    pub build_name: String,
    pub pipeline_name: Option<String>,
    pub job_name: Option<String>,
}

impl From<&BuildRecord> for BuildLabels {
    fn from(build: &BuildRecord) -> Self {
        Self {
            build_id: build.id,
            build_name: build.name.clone(),
            pipeline_name: build.pipeline_name.clone(),
            job_name: build.job_name.clone(),
        }
    }
}

/// Events emitted during build tracking and execution
#[derive(Debug, Clone)]
pub enum BuildEvent {
    /// A tracker took over the build and is about to run it
    BuildStarted { labels: BuildLabels },

    /// The tracked build reached the end of its run
    BuildFinished {
        labels: BuildLabels,
        status: BuildStatus,
        duration: Duration,
    },

    /// A step began running
    StepStarted { build_id: BuildId, step_name: String },

    /// Output line produced by a step's script
    StepOutput {
        build_id: BuildId,
        step_name: String,
        output: String,
        is_error: bool,
    },

    /// A step ran to completion (possibly with a non-zero exit status)
    StepCompleted {
        build_id: BuildId,
        step_name: String,
        exit_status: ExitStatus,
        version: Option<VersionInfo>,
    },

    /// A step failed to execute
    StepErrored {
        build_id: BuildId,
        step_name: String,
        message: String,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        build_id: Option<BuildId>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl BuildEvent {
    /// Create a build started event
    pub fn build_started(build: &BuildRecord) -> Self {
        Self::BuildStarted {
            labels: build.into(),
        }
    }

    /// Create a build finished event; duration is end time minus start time
    pub fn build_finished(build: &BuildRecord) -> Self {
        Self::BuildFinished {
            labels: build.into(),
            status: build.status,
            duration: build.duration().unwrap_or_default(),
        }
    }

    /// Create a step started event
    pub fn step_started(build_id: BuildId, step_name: impl Into<String>) -> Self {
        Self::StepStarted {
            build_id,
            step_name: step_name.into(),
        }
    }

    /// Create a step output event
    pub fn step_output(
        build_id: BuildId,
        step_name: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            build_id,
            step_name: step_name.into(),
            output: output.into(),
            is_error,
        }
    }

    /// Create a step completed event
    pub fn step_completed(
        build_id: BuildId,
        step_name: impl Into<String>,
        exit_status: ExitStatus,
        version: Option<VersionInfo>,
    ) -> Self {
        Self::StepCompleted {
            build_id,
            step_name: step_name.into(),
            exit_status,
            version,
        }
    }

    /// Create a step errored event
    pub fn step_errored(
        build_id: BuildId,
        step_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::StepErrored {
            build_id,
            step_name: step_name.into(),
            message: message.into(),
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, build_id: Option<BuildId>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            build_id,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, build_id: Option<BuildId>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            build_id,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, build_id: Option<BuildId>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            build_id,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: BuildEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: BuildEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: BuildEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn finished_build() -> BuildRecord {
        let start = Utc::now();
        let mut build = BuildRecord::new(BuildId(7), "7");
        build.pipeline_name = Some("main".to_string());
        build.job_name = Some("publish".to_string());
        build.status = BuildStatus::Succeeded;
        build.start_time = Some(start);
        build.end_time = Some(start + ChronoDuration::seconds(30));
        build
    }

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();
        let build = finished_build();

        tx.send_event(BuildEvent::build_started(&build));
        tx.send_event(BuildEvent::step_started(build.id, "publish"));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, BuildEvent::BuildStarted { .. }));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(event2, BuildEvent::StepStarted { .. }));
    }

    #[test]
    fn test_build_finished_carries_status_and_duration() {
        let event = BuildEvent::build_finished(&finished_build());

        if let BuildEvent::BuildFinished {
            labels,
            status,
            duration,
        } = event
        {
            assert_eq!(labels.build_id, BuildId(7));
            assert_eq!(labels.pipeline_name.as_deref(), Some("main"));
            assert_eq!(labels.job_name.as_deref(), Some("publish"));
            assert_eq!(status, BuildStatus::Succeeded);
            assert_eq!(duration, Duration::from_secs(30));
        } else {
            panic!("wrong event type");
        }
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(BuildEvent::info("test", None));
    }
}
