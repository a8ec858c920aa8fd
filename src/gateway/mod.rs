//! HTTP adapter for the OTP backend.
//!
//! [`ApiClient`] issues the requests; [`classify`] turns each finished
//! exchange into an [`ApiOutcome`]. Auth-failure handling lives one layer up
//! in [`SessionGuard`](crate::guard::SessionGuard).

mod client;
mod outcome;

pub use client::{ApiClient, LoginRequest};
pub use outcome::{ApiOutcome, ClientError, Unreachable, classify};
