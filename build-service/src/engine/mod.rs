// Build Engines
// Engine contracts, the engine registry, and the engines that implement them

pub mod db_engine;
pub mod exec_engine;

pub use db_engine::{DbBuild, DbEngine};
pub use exec_engine::ExecEngine;

use crate::db::{BuildRecord, StoreError};
use crate::exec::ExecError;
use crate::plan::{Plan, PlanError, PublicPlan};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// A build names an engine the registry doesn't know about
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown build engine: {engine}")]
pub struct UnknownEngineError {
    pub engine: String,
}

/// Errors raised while creating, looking up or aborting builds
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    UnknownEngine(#[from] UnknownEngineError),

    #[error("No build engines are registered")]
    NoEngines,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid engine metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),

    #[error("Invalid plan: {0}")]
    Plan(#[from] PlanError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),
}

/// A pluggable backend able to create and look up builds
#[async_trait]
pub trait Engine: Send + Sync {
    /// Name persisted on builds started by this engine
    fn name(&self) -> &str;

    /// Allocate an engine-specific build for a persisted build and its plan
    async fn create_build(
        &self,
        build: &BuildRecord,
        plan: &Plan,
    ) -> Result<Arc<dyn EngineBuild>, EngineError>;

    /// Reconstruct the engine-specific build from a persisted build's metadata
    async fn lookup_build(&self, build: &BuildRecord) -> Result<Arc<dyn EngineBuild>, EngineError>;
}

/// Engine-specific build capabilities
#[async_trait]
pub trait EngineBuild: Send + Sync {
    /// Opaque metadata persisted alongside the engine name
    fn metadata(&self) -> String;

    /// Stop the build; safe to call concurrently with `resume`
    async fn abort(&self) -> Result<(), EngineError>;

    /// Run the build until it finishes or is aborted
    async fn resume(&self);

    /// The plan with secrets stripped
    async fn public_plan(&self) -> Result<PublicPlan, EngineError>;
}

/// Ordered registry of engines; the first one creates new builds
#[derive(Clone, Default)]
pub struct Engines {
    engines: Vec<Arc<dyn Engine>>,
}

impl Engines {
    pub fn new(engines: Vec<Arc<dyn Engine>>) -> Self {
        Self { engines }
    }

    /// Add an engine at the end of the list
    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engines.push(engine);
        self
    }

    /// The engine used for new builds
    pub fn first(&self) -> Option<&Arc<dyn Engine>> {
        self.engines.first()
    }

    /// Find an engine by name
    pub fn lookup(&self, name: &str) -> Option<&Arc<dyn Engine>> {
        self.engines.iter().find(|engine| engine.name() == name)
    }

}

impl std::fmt::Debug for Engines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.engines.iter().map(|engine| engine.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedEngine(&'static str);

    #[async_trait]
    impl Engine for NamedEngine {
        fn name(&self) -> &str {
            self.0
        }

        async fn create_build(
            &self,
            _build: &BuildRecord,
            _plan: &Plan,
        ) -> Result<Arc<dyn EngineBuild>, EngineError> {
            unimplemented!("not used by registry tests")
        }

        async fn lookup_build(
            &self,
            _build: &BuildRecord,
        ) -> Result<Arc<dyn EngineBuild>, EngineError> {
            unimplemented!("not used by registry tests")
        }
    }

    #[test]
    fn test_lookup_by_name() {
        let engines = Engines::default()
            .with_engine(Arc::new(NamedEngine("exec")))
            .with_engine(Arc::new(NamedEngine("legacy")));

        assert_eq!(format!("{:?}", engines), r#"["exec", "legacy"]"#);
        assert_eq!(engines.first().unwrap().name(), "exec");
        assert_eq!(engines.lookup("legacy").unwrap().name(), "legacy");
        assert!(engines.lookup("missing").is_none());
    }

    #[test]
    fn test_unknown_engine_message() {
        let err = EngineError::from(UnknownEngineError {
            engine: "bogus".to_string(),
        });
        assert_eq!(err.to_string(), "unknown build engine: bogus");
    }
}
