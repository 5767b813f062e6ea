//! The postern controller
//!
//! Wires the message store, route table, directory and delivery processor
//! together from a RON configuration file and exposes them to operators over
//! the control socket. [`cli`] is the operator side of that socket.

pub mod cli;
pub mod control_handler;
pub mod controller;

pub use control_handler::PosternControlHandler;
pub use controller::{Instance, Postern, SHUTDOWN_BROADCAST};
