//! Amargo gateway: the pull-through cache engine, its protocol adapters,
//! and the background eviction loop, wired over the artifact service and
//! the metadata store.

pub mod api;
pub mod bootstrap;
pub mod cache;
pub mod cli;
pub mod runtime;
pub mod state;
pub mod upstream;
