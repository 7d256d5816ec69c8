//! Core domain types and traits for the Buildplane control plane.
//!
//! This crate contains:
//! - Resource identifiers and the error taxonomy
//! - Workspaces, templates, builds and their derived status
//! - Provisioner jobs, daemons and tag matching
//! - The resource tree produced by a completed job
//! - Collaborator traits (authorization, pub/sub, notifications, audit)

pub mod audit;
pub mod authz;
pub mod error;
pub mod events;
pub mod id;
pub mod job;
pub mod notification;
pub mod resource;
pub mod timing;
pub mod workspace;

pub use error::{Error, Result};
pub use id::ResourceId;
