//! Tollgate - Request Admission Control and Shared-State Cache
//!
//! This crate provides sliding-window admission control and a TTL cache over
//! a shared keyed store. Every replica of a service pointed at the same
//! store sees the same windows and cached values, so limits hold across the
//! whole deployment rather than per process.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;
