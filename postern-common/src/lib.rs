//! Shared building blocks for the postern delivery core
//!
//! - Logging bootstrap and the `internal!` family of macros
//! - The shutdown [`Signal`] broadcast between long-running services
//! - [`Domain`] and envelope address helpers
//! - The [`directory`] of smtpd users and accepted recipient hosts

pub mod address;
pub mod directory;
pub mod domain;
pub mod logging;

pub use address::{domain_of, is_null_sender, redact_email};
pub use directory::{Directory, DirectoryError, RcptHost, SmtpdUser, UserSeed};
pub use domain::Domain;
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
