//! # keyless-agent
//!
//! Gateway agent library for keyless.
//!
//! This library provides the lock output drivers, logging setup and the
//! local status API used by the `keyless-agent` binary.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod actuator;
pub mod api;
pub mod logging;
pub mod state;
