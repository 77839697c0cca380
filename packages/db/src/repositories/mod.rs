//! Repository implementations for database operations.

mod job_store;
mod record;

pub use job_store::{ABANDONED_ERROR, JobFilter, JobStore};
