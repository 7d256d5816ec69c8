//! Job scheduling views for Buildplane.
//!
//! Computes queue positions and worker matches for provisioner jobs at read
//! time, announces new jobs to idle workers, and turns a build request into
//! the build and job rows written by the submission pipeline.

pub mod builder;
pub mod queue;

pub use builder::{BuildRequest, BuiltWorkspace, GraphBuilder, ParameterValue, WorkspaceBuilder};
pub use queue::{
    JobQueue, JobWithQueuePosition, MatchedProvisioners, STALE_INTERVAL, announce_job, is_live,
    matched_provisioners,
};
