pub mod access;
pub mod config;
pub mod curvelog;
pub mod error;
pub mod filter;
pub mod history;
pub mod message;
pub mod metrics;
pub mod ringbuf;
pub mod router;
pub mod store;
pub mod subscription;
pub mod ticker;
pub mod transport;
pub mod tree;
pub mod value;
