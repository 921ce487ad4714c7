// Composite Steps
// Aggregate and on-success compositions of child steps

use super::{ExecError, ResultKind, SourceRepository, Step, StepFactory, StepResult};
use crate::signals::{self, CancelSignal, ReadySignal};

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;

/// Runs its children concurrently against the same repository
pub struct Aggregate {
    steps: Vec<Box<dyn Step>>,
}

impl Aggregate {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl Step for Aggregate {
    async fn run(&mut self, cancel: CancelSignal, ready: ReadySignal) -> Result<(), ExecError> {
        let mut receivers = Vec::with_capacity(self.steps.len());
        let mut runs = Vec::with_capacity(self.steps.len());
        for step in self.steps.iter_mut() {
            let (child_ready, receiver) = signals::ready_channel();
            receivers.push(receiver);
            runs.push(step.run(cancel.clone(), child_ready));
        }

        // ready once every child is; a child that never starts leaves this unfired
        let all_ready = async move {
            for receiver in receivers {
                if receiver.await.is_err() {
                    return;
                }
            }
            let _ = ready.send(());
        };

        let (results, ()) = tokio::join!(join_all(runs), all_ready);

        let errors: Vec<ExecError> = results.into_iter().filter_map(Result::err).collect();
        match ExecError::from_errors(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn release(&mut self) {
        for step in self.steps.iter_mut() {
            step.release();
        }
    }

    fn result(&self, kind: ResultKind) -> Option<StepResult> {
        match kind {
            ResultKind::Success => Some(StepResult::Success(
                self.steps.iter().all(|step| step.succeeded()),
            )),
            _ => None,
        }
    }
}

/// Runs `next` only once `step` succeeded
pub struct OnSuccess {
    step: Box<dyn Step>,
    next: Box<dyn Step>,
    next_ran: bool,
}

impl OnSuccess {
    pub fn new(step: Box<dyn Step>, next: Box<dyn Step>) -> Self {
        Self {
            step,
            next,
            next_ran: false,
        }
    }
}

#[async_trait]
impl Step for OnSuccess {
    async fn run(&mut self, cancel: CancelSignal, ready: ReadySignal) -> Result<(), ExecError> {
        self.step.run(cancel.clone(), ready).await?;

        if !self.step.succeeded() {
            return Ok(());
        }

        if signals::is_cancelled(&cancel) {
            return Err(ExecError::Interrupted);
        }

        let (next_ready, _) = signals::ready_channel();
        self.next_ran = true;
        self.next.run(cancel, next_ready).await
    }

    fn release(&mut self) {
        self.step.release();
        self.next.release();
    }

    fn result(&self, kind: ResultKind) -> Option<StepResult> {
        if self.next_ran {
            self.next.result(kind)
        } else {
            self.step.result(kind)
        }
    }
}

/// Builds an [`Aggregate`] from child factories
pub struct AggregateFactory(pub Vec<Box<dyn StepFactory>>);

impl StepFactory for AggregateFactory {
    fn using(&self, repository: Arc<SourceRepository>) -> Box<dyn Step> {
        Box::new(Aggregate::new(
            self.0
                .iter()
                .map(|factory| factory.using(repository.clone()))
                .collect(),
        ))
    }
}

/// Builds an [`OnSuccess`] from two factories
pub struct OnSuccessFactory {
    pub step: Box<dyn StepFactory>,
    pub next: Box<dyn StepFactory>,
}

impl StepFactory for OnSuccessFactory {
    fn using(&self, repository: Arc<SourceRepository>) -> Box<dyn Step> {
        Box::new(OnSuccess::new(
            self.step.using(repository.clone()),
            self.next.using(repository),
        ))
    }
}
