mod batch;
mod item;

pub use batch::{
    Job, JobId, JobSettings, JobStatus, MAX_ITEMS_PER_JOB, SubmitRequest, derive_status,
};
pub use item::{
    ItemError, ItemInput, ItemResult, ItemState, ItemTask, ItemTransition, RetryPolicy,
    TransitionError,
};
