//! The BrowserFairy monitoring engine: browser-protocol client plumbing,
//! per-target sessions and collectors, per-host time-series writers, and
//! the supervisor tying them together. The `fairyd` binary is a thin shell
//! over [`engine::run`]; external front-ends drive the same API.

pub mod collectors;
pub mod correlate;
pub mod engine;
pub mod launcher;
pub mod limiter;
pub mod overview;
pub mod registry;
pub mod session;
pub mod sourcemap;
pub mod supervisor;
pub mod util;
pub mod writer;
