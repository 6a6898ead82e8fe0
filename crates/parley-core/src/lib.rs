pub mod access;
pub mod assistant;
pub mod audit;
pub mod collab;
pub mod config;
pub mod error;
pub mod executor;
pub mod intent;
pub mod metrics;
pub mod model;
pub mod rate_limit;
pub mod response;
pub mod retrieval;
pub mod retry;
pub mod scrub;
pub mod session_store;
pub mod storage;

pub use error::{ParleyError, Result};
