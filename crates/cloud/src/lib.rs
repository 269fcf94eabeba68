//! AWS-facing collaborators of the intake worker.
//!
//! - [`queue`] -- the [`JobQueue`](queue::JobQueue) contract the worker
//!   consumes, with [`sqs`] as the production implementation and
//!   [`memory`] as an in-process queue for local runs and tests.
//! - [`storage`] -- uploads finished artifacts to object storage.
//! - [`notify`] -- publishes job completion events.

pub mod memory;
pub mod notify;
pub mod queue;
pub mod sqs;
pub mod storage;

use aws_config::{BehaviorVersion, Region, SdkConfig};

/// Load shared AWS configuration (credentials chain, retry config) for
/// the given region.
pub async fn load_sdk_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}
