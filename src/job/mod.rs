//! Jobs: status state machine and data model.

pub mod model;
pub mod state;

pub use model::{
    CredentialResult, CredentialSource, Job, JobOutcome, JobSpec, ResultStatus,
    JOB_LEVEL_IDENTIFIER,
};
pub use state::JobStatus;
