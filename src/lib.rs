//! Pull-based media pipeline scheduler
//!
//! Sinks driven by a presentation clock pull samples through a graph of
//! streams (the topology). A session owns the active topology and can replace
//! it live without breaking packet numbering. Mixers align independently
//! timed inputs frame-accurately; pools recycle the media buffers.

pub mod assets;
pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod mixer;
pub mod pipeline;
pub mod pool;
pub mod work;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;
