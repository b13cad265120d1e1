//! Proxmox Virtual Tape Library
//!
//! Runs the logical units of [vtl_tape] behind a transport. Every unit
//! is served by its own thread, units talk to each other over the
//! [message_bus](message_bus::MessageBus).

pub mod transport;

pub mod message_bus;

pub mod units;

pub mod server;
