//! # etcdq
//!
//! Priority job queue on top of etcd.
//!
//! Producers add [`Item`](model::Item)s to a bucket with a weight; workers
//! pop the heaviest (then oldest) item of a bucket, blocking on an etcd
//! watch while the bucket is empty. An HTTP front door ([`web`]) exposes
//! the queue to clients and workers.

pub mod config;
pub mod error;
pub mod key;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod web;
