//! Worker service: receives dispatched jobs, builds and runs them in a
//! sandboxed container, and reports the result to the controller.
//!
//! ## Flow
//!
//! ```text
//! POST /enqueue ──> LocalQueue ──> consume() ── countdown, run slot ──> JobRunner::run
//!                                                                          │
//!     relay.start ──> Sandbox::execute ──> relay.complete | relay.fail | relay.error
//! ```
//!
//! The worker never stores job state. Each run gets its own scratch
//! directory, image tag and container, all removed when the run ends.

pub mod archive;
pub mod relay;
pub mod runtime;
pub mod sandbox;
pub mod server;
pub mod task;

pub use relay::{CallbackPaths, CallbackRelay};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use sandbox::{ExecutionOutcome, Sandbox, SandboxConfig};
pub use server::WorkerState;
pub use task::{JobRunner, RunReport, consume};
