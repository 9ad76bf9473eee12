//! Application-level orchestration.
//!
//! The stage pipeline and active-learning loop run against an explicit
//! [`Session`]; the controller owns the job lifecycle and post-processing
//! hands results to presentation layers.

mod active_learning;
mod controller;
mod pipeline;
mod post_process;
mod session;
mod surrogate;
#[cfg(test)]
pub(crate) mod testing;

pub(crate) use active_learning::OptimizeSettings;
#[cfg(test)]
pub(crate) use active_learning::{OptimizeReport, StopReason};
pub(crate) use controller::{run_controller, Job, JobOutput, RunPlan};
pub(crate) use post_process::{process_job_completion, StoreCounts};
pub(crate) use session::{Session, SessionSettings};
