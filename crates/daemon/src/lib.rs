#![forbid(unsafe_code)]

//! Local build-environment daemon: keeps a snapshot of the kind cluster and
//! source repositories, and runs one build/deploy/verify operation at a time.

pub mod builder;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod deploy;
pub mod engine;
pub mod http;
pub mod ops;
pub mod process;
pub mod reconciler;
pub mod refresher;
pub mod store;
pub mod tracker;

#[cfg(test)]
mod testing;
