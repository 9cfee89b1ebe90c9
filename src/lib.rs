//! Deterministic command execution with a content-addressed result store.
//!
//! Requests are canonicalized and hashed with BLAKE3, executed inside a
//! contained workspace, and their results are stored in a versioned CAS
//! where they can later be replayed and verified.

pub mod adapters;
pub mod audit;
pub mod bench;
pub mod canonical;
pub mod cas;
pub mod config;
pub mod diagnostics;
pub mod digest;
pub mod drift;
pub mod engine;
pub mod ffi;
pub mod ledger;
pub mod observability;
pub mod ports;
pub mod registry;
pub mod replay;
pub mod sandbox;
pub mod schema;
pub mod stats;
pub mod version;

pub use config::EngineConfig;
pub use digest::Digest;
pub use engine::{Engine, EngineError, ErrorDoc, ExecOptions, ExecOutcome};
pub use registry::{Operation, OperationRegistry};
pub use schema::{ErrorCode, ExecutionRequest, ExecutionResult};
