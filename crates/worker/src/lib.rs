//! `imagex-worker` library crate.
//!
//! The background intake worker: a [`poller::Poller`] long-polls the job
//! queue and hands each message to the [`dispatcher::Dispatcher`], which
//! runs it on the generation engine while keeping the message hidden from
//! other consumers. [`supervisor::WorkerSupervisor`] owns the poller task
//! and is the only piece a host application talks to. The binary
//! entrypoint lives in `main.rs`.

pub mod backends;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod poller;
pub mod supervisor;
