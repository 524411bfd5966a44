//! CogWorks node execution and the graph execution engine.
//!
//! This crate drives a validated [`pipeline::graph::PipelineGraph`] to a
//! terminal disposition. It executes generative, deterministic and spawning
//! nodes through the port traits of the [`pipeline`] crate, verifies
//! alignment, evaluates edge conditions, and owns the dispatch loop.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Sequences calls between the business logic in
//! [`pipeline`] and the infrastructure ports (LLM, domain services, state
//! store, work-item tracker). It holds no domain rules of its own.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`engine`] | `GraphExecutionEngine`, `EngineConfig`, `RunRequest` |
//! | [`executor`] | `NodeExecutor`: retry and rework loop of one node |
//! | [`alignment`] | `AlignmentVerifier`: structural + adversarial semantic checks |
//! | [`edges`] | `EdgeEvaluator`: expression, judged and composite conditions |
//! | [`retry`] | Infrastructure retry with capped backoff |
//! | [`memory`] | `InMemoryStateStore` |

pub mod alignment;
pub mod edges;
pub mod engine;
pub mod executor;
pub mod memory;
pub mod retry;

pub use engine::{EngineConfig, EngineServices, GraphExecutionEngine, RunRequest};
pub use memory::InMemoryStateStore;
pub use retry::RetryBackoffConfig;
