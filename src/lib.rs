//! Distributed ray scheduling core.
//!
//! Scenes too large for one node are split into domains owned by MPI ranks.
//! Rays visit the domains they overlap front to back, closest hits are
//! reconciled through a shared visibility buffer, shadow and indirect rays
//! are routed to whatever rank holds the next domain, and a collective
//! reduce detects global quiescence.

#[macro_use]
extern crate log;

pub mod app;
pub mod arena;
pub mod atomic;
pub mod cache;
pub mod camera;
pub mod cluster;
pub mod common;
pub mod error;
pub mod geometry;
pub mod image;
pub mod insitu;
pub mod isector;
pub mod ooc;
pub mod partition;
pub mod qvector;
pub mod rays;
pub mod renderer;
pub mod rng;
pub mod scan;
pub mod scene;
pub mod shader;
pub mod tcontext;
pub mod tile;
pub mod vbuf;
pub mod work_stats;
