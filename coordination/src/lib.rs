//! Simulation Assistant Coordination Library
//!
//! Routes a natural-language question about simulation code to a set of
//! specialised worker variants, runs the best of them concurrently under a
//! deadline and reconciles their answers into one result.
//!
//! # Components
//!
//! - [`worker`]: the capability/confidence contract and keyword scoring
//! - [`registry`]: name → factory, per-session instances, health
//! - [`session`]: sessions, their context and single-writer leases
//! - [`message`]: typed envelopes and per-session priority mailboxes
//! - [`coordinator`]: selection, dispatch, conflict detection, consensus
//! - [`persistence`]: optional interaction sinks (memory, JSONL)
//! - [`runner`]: boundary to the external code runner (workers only)
//!
//! # Usage
//!
//! ```ignore
//! let registry = WorkerRegistry::new().shared();
//! registry.register_worker("physics", PhysicsWorker::default)?;
//!
//! let coordinator = Coordinator::new(registry, CoordinatorConfig::from_env()?);
//! coordinator.create_session("s1", None, None).await?;
//! let result = coordinator
//!     .coordinate("s1", CoordinationRequest::new("help me set up a rigid body simulation"))
//!     .await?;
//! println!("{}: {}", result.primary.variant, result.primary.answer);
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod persistence;
pub mod registry;
pub mod runner;
pub mod session;
pub mod worker;

pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{
    Conflict, ConflictReason, CoordinationPhase, CoordinationRequest, CoordinationResult,
    Coordinator, RankedWorker, SharedCoordinator,
};
pub use error::{CoordinatorError, CoordinatorResult};
pub use message::{Mailbox, Message, MessageKind, Priority};
pub use persistence::{
    InteractionRecord, InteractionSink, JsonlInteractionSink, MemoryInteractionSink, SinkError,
};
pub use registry::{RegistryError, SharedRegistry, WorkerHealth, WorkerInfo, WorkerRegistry};
pub use runner::{CodeRunner, RunOutput, RunnerError, SharedCodeRunner, StructuredError};
pub use session::{ContextPatch, Context, NotebookRef, Session, SessionState};
pub use worker::{
    tags, CallContext, Capability, FailureKind, KeywordProfile, Scratchpad, ScoringWeights,
    SharedWorker, Worker, WorkerError, WorkerFailure, WorkerReply, WorkerResponse,
};
