//! # qbridge - Queue Bridge
//!
//! An HTTP gateway that bridges application message handlers to Google Cloud
//! Pub/Sub topics and subscriptions and to Cloud Tasks queues.
//!
//! qbridge owns the delivery and acknowledgement protocol: resource naming and
//! lifecycle, publish with optional auto-creation, pull-batch consumption with
//! requeue on handler failure, verified push consumption, and task publishing.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admin;
pub mod auth;
pub mod backend;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod publisher;
pub mod server;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
