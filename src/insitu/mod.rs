//! In-situ mode: fixed domain ownership with cross-rank ray forwarding.

pub mod comm;
pub mod tracer;

pub use tracer::MultiThreadTracer;
