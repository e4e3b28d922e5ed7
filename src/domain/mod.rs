//! Domain layer: entities, value objects and the ports the engine depends on.
//!
//! Nothing in here performs I/O. Billing math lives in [`pricing`] and is a
//! pure function of its inputs; state transitions on [`session::Session`]
//! return new rows instead of mutating storage.

pub mod events;
pub mod loyalty;
pub mod money;
pub mod payment;
pub mod ports;
pub mod pricing;
pub mod session;
pub mod staff;
pub mod station;
