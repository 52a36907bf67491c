//! Transport boundary: client contract, per-vBucket observers, rollback
//! mitigation.

mod client;
mod observer;
mod rollback;

pub use client::*;
pub use observer::*;
pub use rollback::*;
