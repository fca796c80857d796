pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod failure_cache;
pub mod filter;
pub mod metadata;
pub mod notify;
pub mod output;
pub mod placement;
pub mod policy;
pub mod registry;
pub mod store;
pub mod transfer;
pub mod transport;
