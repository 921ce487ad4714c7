// Build Service Library
// Build tracking, lifecycle engine and step execution core

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod exec;
pub mod plan;
pub mod resource;
pub mod signals;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult};

// Re-export configuration types
pub use config::{BackendConfig, ConfigError, ServiceConfig};

// Re-export persistence types
pub use db::{
    AbortNotifier, BuildId, BuildRecord, BuildStatus, BuildStore, InMemoryBuildStore, StoreError,
    TrackingLock, TrackingLockGuard,
};

// Re-export engine types
pub use engine::{
    DbBuild, DbEngine, Engine, EngineBuild, EngineError, Engines, ExecEngine, UnknownEngineError,
};

// Re-export event types
pub use events::{
    progress_channel, BuildEvent, BuildLabels, EventSender, LogLevel, ProgressReceiver,
    ProgressSender,
};

// Re-export plan types
pub use plan::{Plan, PlanError, PublicPlan, PutPlan};

// Re-export step types
pub use exec::{
    ExecError, ExitStatus, ReleasePolicy, ResultKind, SourceName, SourceRepository, Step,
    StepFactory, StepResult, VersionInfo,
};

// Re-export resource types
pub use resource::{
    ContainerTracker, DockerProvider, LocalProvider, Resource, ResourceError, Tracker,
    VersionedSource,
};
