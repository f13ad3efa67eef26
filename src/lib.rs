//! Provider-side execution coordinator for a GPU compute marketplace.
//!
//! A claimed job arrives over local HTTP, runs in an isolated container, and
//! comes back as a result reference (an inline hash or an `ipfs://` locator)
//! that the caller submits on-chain as proof of completion.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hasher;
pub mod job;
pub mod probe;
pub mod sandbox;
pub mod server;
pub mod service;
pub mod storage;
pub mod workspace;
