//! Gateway core primitives.
//!
//! The route table of the gateway is derived once from configuration and is
//! read-only afterwards. This crate owns that table and the allow/deny
//! decision made against it; it has no I/O and no async.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod policy;

pub use policy::{AccessPolicyTable, Decision, PolicyEntry, PolicyError, RoleSets, Tier};
