//! NextGCore Core Utilities Library
//!
//! Building blocks shared by the NextGCore network functions.

pub mod pkbuf; // Packet buffer (ogs-pkbuf.h)
pub mod pool; // Object pool (ogs-pool.h)

pub use pkbuf::OgsPkbuf;
pub use pool::{OgsPool, OgsPoolId, PoolError, PoolResult};
