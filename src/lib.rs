//! fault-bridge - MassTransit to ServiceControl fault bridge
//!
//! Forwards faulted MassTransit messages from their error queues to the
//! ServiceControl error queue, translating headers on the way, and routes
//! messages ServiceControl retries back to their original input queues.

pub mod bus;
pub mod config;
pub mod diagnostics;
pub mod discovery;
pub mod dlq;
pub mod error;
pub mod services;
pub mod translate;
pub mod utils;
