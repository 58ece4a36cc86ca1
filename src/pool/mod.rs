//! Buffer pooling
//!
//! Steady-state processing must not touch the allocator: every buffer a
//! mixer or generator fills comes from a [`BufferPool`] and goes back to it
//! when the last sample referencing it is dropped.

mod buffer_pool;
mod frames;

pub use buffer_pool::{BufferPool, Poolable, PooledBuffer, SlotHandle};
pub use frames::{FrameSize, PcmBlock, PcmShape, RgbaFrame};
