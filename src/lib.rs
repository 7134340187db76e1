// src/lib.rs

//! Galena Package Transaction Engine
//!
//! The fetch/verify/install/remove core of a binary package manager:
//! ranked failover-capable mirrors, binary delta reconstruction, a
//! streaming content-ledger format with out-of-core merge/filter, and an
//! atomic install/remove filesystem transaction with config-file
//! protection.
//!
//! # Architecture
//!
//! - Step pipeline: one action = one immutable step list, integer results
//! - Metadata through traits: SQL store, hook layer and transport are
//!   external collaborators behind [`repository::Repository`],
//!   [`hooks::PackageHooks`] and [`transport::Transport`]
//! - Content ledgers: durable line-record files, restartably re-iterable
//! - Leniency on live-filesystem oddities: repair and warn, don't abort

pub mod codes;
pub mod content;
pub mod db;
pub mod delta;
pub mod download;
mod error;
pub mod hooks;
pub mod install;
pub mod lock;
pub mod mirrors;
pub mod protect;
pub mod remove;
pub mod repository;
pub mod settings;
pub mod transaction;
pub mod transport;
pub mod unpack;
pub mod verify;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
