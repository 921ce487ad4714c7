// Failure Reporter
// Reports a step's execution error before passing it on

use super::{ExecError, ResultKind, Step, StepResult};
use crate::signals::{CancelSignal, ReadySignal};

use async_trait::async_trait;

/// Callback invoked with the error of a failed run
pub type FailureCallback = Box<dyn Fn(&ExecError) + Send + Sync>;

/// Wraps a step so its delegate always observes a terminal outcome
pub struct FailureReporter {
    step: Box<dyn Step>,
    report: FailureCallback,
}

impl FailureReporter {
    pub fn new(step: Box<dyn Step>, report: FailureCallback) -> Self {
        Self { step, report }
    }
}

#[async_trait]
impl Step for FailureReporter {
    async fn run(&mut self, cancel: CancelSignal, ready: ReadySignal) -> Result<(), ExecError> {
        let result = self.step.run(cancel, ready).await;
        if let Err(err) = &result {
            (self.report)(err);
        }
        result
    }

    fn release(&mut self) {
        self.step.release();
    }

    fn result(&self, kind: ResultKind) -> Option<StepResult> {
        self.step.result(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals;
    use std::sync::{Arc, Mutex};

    struct Fixed(Option<ExecError>);

    #[async_trait]
    impl Step for Fixed {
        async fn run(&mut self, _cancel: CancelSignal, _ready: ReadySignal) -> Result<(), ExecError> {
            match self.0.take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn release(&mut self) {}

        fn result(&self, kind: ResultKind) -> Option<StepResult> {
            match kind {
                ResultKind::Success => Some(StepResult::Success(true)),
                _ => None,
            }
        }
    }

    fn reporter(step: Fixed) -> (FailureReporter, Arc<Mutex<Vec<String>>>) {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let reporter = FailureReporter::new(
            Box::new(step),
            Box::new(move |err: &ExecError| sink.lock().unwrap().push(err.to_string())),
        );
        (reporter, reported)
    }

    #[tokio::test]
    async fn test_reports_then_propagates() {
        let (mut step, reported) = reporter(Fixed(Some(ExecError::Interrupted)));
        let (_cancel_tx, cancel) = signals::cancel_channel();
        let (ready, _) = signals::ready_channel();

        let result = step.run(cancel, ready).await;

        assert!(matches!(result, Err(ExecError::Interrupted)));
        assert_eq!(*reported.lock().unwrap(), vec!["Step was interrupted".to_string()]);
    }

    #[tokio::test]
    async fn test_success_is_not_reported() {
        let (mut step, reported) = reporter(Fixed(None));
        let (_cancel_tx, cancel) = signals::cancel_channel();
        let (ready, _) = signals::ready_channel();

        step.run(cancel, ready).await.unwrap();

        assert!(reported.lock().unwrap().is_empty());
        assert!(step.succeeded());
    }
}
