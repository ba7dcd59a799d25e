//! The memory subsystem: domain types, the create/retrieve pipeline,
//! workspace scoping, and the evolution engine.

pub mod codec;
pub mod evolution;
pub mod schema;
pub mod service;
#[doc(hidden)]
pub mod testutil;
pub mod workspace;

pub use evolution::{EvolutionEngine, EvolveRequest, EvolveSummary, Scope, TriggerType};
pub use schema::{LinkOutcome, LinkType, Memory, MemoryAnalysis, MemoryLink};
pub use service::{
    CreateMemoryRequest, CreateMemoryResponse, MemoryService, RetrieveRequest, RetrieveResponse,
    RetrievedMemory, link_strength, retrieval_similarity,
};
pub use workspace::{WorkspaceError, WorkspaceInfo, WorkspaceService, default_identifier, normalize};
