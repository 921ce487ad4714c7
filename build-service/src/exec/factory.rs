// Step Builder
// Turns a plan into step factories for one build

use super::{
    AggregateFactory, EventDelegate, OnSuccessFactory, PutStep, ReleasePolicy, StepFactory,
};
use crate::db::BuildRecord;
use crate::events::ProgressSender;
use crate::plan::Plan;
use crate::resource::{Session, StepMetadata, Tracker};

use std::sync::Arc;

/// Builds the step tree of a build
pub struct StepBuilder {
    build: BuildRecord,
    tracker: Arc<dyn Tracker>,
    event_tx: Option<ProgressSender>,
    release_policy: ReleasePolicy,
}

impl StepBuilder {
    pub fn new(build: BuildRecord, tracker: Arc<dyn Tracker>) -> Self {
        Self {
            build,
            tracker,
            event_tx: None,
            release_policy: ReleasePolicy::default(),
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: Option<ProgressSender>) -> Self {
        self.event_tx = tx;
        self
    }

    pub fn with_release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    pub fn build_step(&self, plan: &Plan) -> Box<dyn StepFactory> {
        match plan {
            Plan::Put(put) => {
                let delegate = EventDelegate::new(self.build.id, put.name.as_str(), self.event_tx.clone());
                Box::new(
                    PutStep::new(
                        put.clone(),
                        StepMetadata::from(&self.build),
                        Session::for_step(self.build.id, "put", &put.name),
                        self.tracker.clone(),
                        Arc::new(delegate),
                    )
                    .with_release_policy(self.release_policy),
                )
            }
            Plan::Aggregate(children) => Box::new(AggregateFactory(
                children.iter().map(|child| self.build_step(child)).collect(),
            )),
            Plan::OnSuccess { step, next } => Box::new(OnSuccessFactory {
                step: self.build_step(step),
                next: self.build_step(next),
            }),
        }
    }
}
