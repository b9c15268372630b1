//! Outbound transfers: queued requests, built transactions waiting for
//! confirmations, and transactions collecting federator signatures.

pub mod builder;
pub mod confirmations;
pub mod request_queue;
pub mod signatures;
