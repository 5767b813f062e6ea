//! Smtpd users and accepted recipient hosts
//!
//! These records are consumed by the inbound path (relay authorisation and
//! "do we accept mail for this host") and managed by the operator through the
//! control surface. They take no part in delivery scheduling.
//!
//! Adds are idempotent: re-adding a login or hostname overwrites the record.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::Domain;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Rcpt host not found: {0}")]
    RcptHostNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DirectoryError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::UserNotFound(_) | Self::RcptHostNotFound(_))
    }
}

/// A user allowed to authenticate against smtpd
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpdUser {
    pub login: String,
    /// Random per-user salt, hex encoded
    pub password_salt: String,
    /// SHA-256 of the salt followed by the clear password, hex encoded
    pub password_hash: String,
    #[serde(default)]
    pub relay_allowed: bool,
}

impl SmtpdUser {
    /// Build a user record, hashing the clear password with a fresh salt
    ///
    /// The digest is a single salted SHA-256 round. It keeps clear passwords
    /// out of memory dumps and listings; it is not a slow password hash.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Config`] for an empty login or password.
    pub fn new(login: &str, password: &str, relay_allowed: bool) -> Result<Self, DirectoryError> {
        let login = login.trim();
        if login.is_empty() {
            return Err(DirectoryError::Config("login must not be empty".to_string()));
        }
        if password.is_empty() {
            return Err(DirectoryError::Config(format!(
                "password for {login} must not be empty"
            )));
        }

        let password_salt = hex::encode(rand::random::<[u8; SALT_LEN]>());
        Ok(Self {
            login: login.to_string(),
            password_hash: hash_password(&password_salt, password),
            password_salt,
            relay_allowed,
        })
    }

    #[must_use]
    pub fn verify_password(&self, password: &str) -> bool {
        hash_password(&self.password_salt, password) == self.password_hash
    }
}

const SALT_LEN: usize = 16;

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// A hostname postern accepts mail for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcptHost {
    pub hostname: Domain,
}

/// Seed entry for a user in the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct UserSeed {
    pub login: String,
    pub password: String,
    #[serde(default)]
    pub relay_allowed: bool,
}

#[derive(Debug, Default)]
pub struct Directory {
    users: DashMap<String, SmtpdUser>,
    rcpt_hosts: DashMap<Domain, RcptHost>,
}

impl Directory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from configuration seeds
    ///
    /// # Errors
    ///
    /// Returns the first invalid seed as a [`DirectoryError::Config`].
    pub fn seeded(users: &[UserSeed], rcpt_hosts: &[String]) -> Result<Self, DirectoryError> {
        let directory = Self::new();
        for seed in users {
            directory.add_user(&seed.login, &seed.password, seed.relay_allowed)?;
        }
        for host in rcpt_hosts {
            directory.add_rcpt_host(host)?;
        }
        Ok(directory)
    }

    /// Add or overwrite a user
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Config`] for an empty login or password.
    pub fn add_user(
        &self,
        login: &str,
        password: &str,
        relay_allowed: bool,
    ) -> Result<SmtpdUser, DirectoryError> {
        let user = SmtpdUser::new(login, password, relay_allowed)?;
        self.users.insert(user.login.clone(), user.clone());
        Ok(user)
    }

    /// # Errors
    ///
    /// Returns [`DirectoryError::UserNotFound`] when no such login exists.
    pub fn del_user(&self, login: &str) -> Result<(), DirectoryError> {
        let login = login.trim();
        self.users
            .remove(login)
            .map(|_| ())
            .ok_or_else(|| DirectoryError::UserNotFound(login.to_string()))
    }

    #[must_use]
    pub fn user(&self, login: &str) -> Option<SmtpdUser> {
        self.users.get(login.trim()).map(|entry| entry.value().clone())
    }

    /// All users, sorted by login
    #[must_use]
    pub fn list_users(&self) -> Vec<SmtpdUser> {
        let mut users: Vec<_> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by(|a, b| a.login.cmp(&b.login));
        users
    }

    /// # Errors
    ///
    /// Returns [`DirectoryError::Config`] for an empty hostname.
    pub fn add_rcpt_host(&self, hostname: &str) -> Result<RcptHost, DirectoryError> {
        let hostname = Domain::new(hostname);
        if hostname.is_empty() {
            return Err(DirectoryError::Config(
                "hostname must not be empty".to_string(),
            ));
        }

        let host = RcptHost {
            hostname: hostname.clone(),
        };
        self.rcpt_hosts.insert(hostname, host.clone());
        Ok(host)
    }

    /// # Errors
    ///
    /// Returns [`DirectoryError::RcptHostNotFound`] when the host is unknown.
    pub fn del_rcpt_host(&self, hostname: &str) -> Result<(), DirectoryError> {
        self.rcpt_hosts
            .remove(&Domain::new(hostname))
            .map(|_| ())
            .ok_or_else(|| DirectoryError::RcptHostNotFound(hostname.to_string()))
    }

    #[must_use]
    pub fn is_rcpt_host(&self, hostname: &str) -> bool {
        self.rcpt_hosts.contains_key(&Domain::new(hostname))
    }

    /// All accepted hosts, sorted by hostname
    #[must_use]
    pub fn list_rcpt_hosts(&self) -> Vec<RcptHost> {
        let mut hosts: Vec<_> = self.rcpt_hosts.iter().map(|e| e.value().clone()).collect();
        hosts.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        hosts
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_add_user_hashes_password() {
        let directory = Directory::new();
        let user = directory.add_user("alice", "s3cret", false).unwrap();

        assert_ne!(user.password_hash, "s3cret");
        assert_eq!(user.password_hash.len(), 64);
        assert_eq!(user.password_salt.len(), 32);
        assert!(user.verify_password("s3cret"));
        assert!(!user.verify_password("wrong"));
        assert!(!user.relay_allowed);
    }

    #[test]
    fn test_same_password_hashes_differently_per_user() {
        let directory = Directory::new();
        let alice = directory.add_user("alice", "shared", false).unwrap();
        let bob = directory.add_user("bob", "shared", false).unwrap();

        assert_ne!(alice.password_salt, bob.password_salt);
        assert_ne!(alice.password_hash, bob.password_hash);
        assert!(alice.verify_password("shared"));
        assert!(bob.verify_password("shared"));
    }

    #[test]
    fn test_logins_are_trimmed_on_every_operation() {
        let directory = Directory::new();
        directory.add_user(" alice ", "pw", true).unwrap();

        assert_eq!(directory.list_users()[0].login, "alice");
        assert!(directory.user("alice").is_some());

        directory.del_user(" alice").unwrap();
        assert!(directory.list_users().is_empty());
        assert_eq!(
            directory.del_user(" alice ").unwrap_err(),
            DirectoryError::UserNotFound("alice".to_string())
        );
    }

    #[test]
    fn test_re_adding_user_overwrites() {
        let directory = Directory::new();
        directory.add_user("alice", "one", false).unwrap();
        directory.add_user("alice", "two", true).unwrap();

        let users = directory.list_users();
        assert_eq!(users.len(), 1);
        assert!(users[0].relay_allowed);
        assert!(users[0].verify_password("two"));
    }

    #[test]
    fn test_del_missing_user_is_not_found() {
        let directory = Directory::new();
        let err = directory.del_user("ghost").unwrap_err();
        assert_eq!(err, DirectoryError::UserNotFound("ghost".to_string()));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_empty_inputs_are_config_errors() {
        let directory = Directory::new();
        assert!(matches!(
            directory.add_user(" ", "pw", false),
            Err(DirectoryError::Config(_))
        ));
        assert!(matches!(
            directory.add_user("bob", "", false),
            Err(DirectoryError::Config(_))
        ));
        assert!(matches!(
            directory.add_rcpt_host(""),
            Err(DirectoryError::Config(_))
        ));
    }

    #[test]
    fn test_rcpt_hosts_sorted_and_case_insensitive() {
        let directory = Directory::new();
        directory.add_rcpt_host("Zeta.org").unwrap();
        directory.add_rcpt_host("alpha.com").unwrap();
        directory.add_rcpt_host("ZETA.org").unwrap();

        let hosts: Vec<String> = directory
            .list_rcpt_hosts()
            .into_iter()
            .map(|h| h.hostname.to_string())
            .collect();
        assert_eq!(hosts, vec!["alpha.com", "zeta.org"]);
        assert!(directory.is_rcpt_host("zeta.ORG"));

        directory.del_rcpt_host("zeta.org").unwrap();
        assert!(!directory.is_rcpt_host("zeta.org"));
        assert!(directory.del_rcpt_host("zeta.org").unwrap_err().is_not_found());
    }

    #[test]
    fn test_seeded_directory() {
        let seeds = vec![UserSeed {
            login: "relay".to_string(),
            password: "pw".to_string(),
            relay_allowed: true,
        }];
        let directory = Directory::seeded(&seeds, &["example.com".to_string()]).unwrap();

        assert!(directory.user("relay").unwrap().relay_allowed);
        assert!(directory.is_rcpt_host("example.com"));
    }
}
