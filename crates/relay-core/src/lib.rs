//! # relay-core
//!
//! Shared building blocks for the relay transport: branded ID newtypes,
//! wire error-code constants, and reconnect backoff math.

#![deny(unsafe_code)]

pub mod backoff;
pub mod codes;
pub mod ids;
