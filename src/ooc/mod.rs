//! Out-of-core mode: any rank processes any domain through a bounded
//! geometry cache.

pub mod domain_stats;
pub mod tracer;

pub use tracer::OocTracer;
