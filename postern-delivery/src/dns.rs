//! MX fallback for destinations without a configured route.
//!
//! Implements MX record lookups with A/AAAA fallback per RFC 5321 section 5.1,
//! cached in a `DashMap` for the record TTL bounded by the configured min/max.
//! The delivery core only sees the [`MxResolver`] trait, so tests and
//! embedding processes can supply their own resolution.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use postern_common::Domain;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_TTL_SECS: u32 = 300;

#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records found for the domain.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// NXDOMAIN
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

impl DnsError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::LookupFailed(_))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Overrides the record TTL for every cached entry when set
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
        }
    }
}

/// A mail exchanger with its preference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    pub host: String,
    /// MX preference (lower wins). 0 for the A/AAAA implicit MX.
    pub priority: u16,
    pub port: u16,
}

impl MailServer {
    #[must_use]
    pub fn new(host: impl Into<String>, priority: u16) -> Self {
        Self {
            host: host.into(),
            priority,
            port: 25,
        }
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolution of a destination domain to its mail exchangers
#[async_trait]
pub trait MxResolver: Send + Sync + std::fmt::Debug {
    /// Mail servers for `domain`, sorted by preference, never empty
    ///
    /// # Errors
    /// Returns a [`DnsError`] when the domain has no usable mail servers or
    /// the lookup itself failed
    async fn resolve_mail_servers(&self, domain: &Domain) -> Result<Arc<Vec<MailServer>>, DnsError>;
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// hickory-backed [`MxResolver`] with a TTL-bounded cache
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<Domain, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    /// Build a resolver from the system configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn with_dns_config(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn cache_ttl(&self, dns_ttl: u32) -> Duration {
        let secs = self.config.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(dns_ttl).clamp(self.config.min_cache_ttl_secs, self.config.max_cache_ttl_secs)
        });
        Duration::from_secs(secs)
    }

    async fn lookup(&self, domain: &Domain) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.mx_lookup(domain.as_str()).await {
            Ok(mx_lookup) => {
                let ttl = mx_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(DEFAULT_TTL_SECS);

                let mut servers: Vec<MailServer> = mx_lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        let host = host.strip_suffix('.').unwrap_or(&host).to_string();
                        MailServer::new(host, mx.preference())
                    })
                    .collect();

                if servers.is_empty() {
                    return self.implicit_mx(domain).await;
                }

                servers.sort_by_key(|s| s.priority);
                Ok((servers, ttl))
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                debug!("No MX records found for {domain}, falling back to A/AAAA");
                self.implicit_mx(domain).await
            }
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }

    /// A/AAAA records of the domain itself, as exchangers with preference 0
    async fn implicit_mx(&self, domain: &Domain) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.lookup_ip(domain.as_str()).await {
            Ok(ip_lookup) => {
                #[allow(clippy::redundant_closure_for_method_calls)]
                let ttl = ip_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(|r| r.ttl())
                    .min()
                    .unwrap_or(DEFAULT_TTL_SECS);

                let servers: Vec<MailServer> = ip_lookup
                    .iter()
                    .map(|ip| MailServer::new(ip.to_string(), 0))
                    .collect();

                if servers.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok((servers, ttl))
                }
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => {
                warn!("A/AAAA lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }
}

#[async_trait]
impl MxResolver for DnsResolver {
    async fn resolve_mail_servers(&self, domain: &Domain) -> Result<Arc<Vec<MailServer>>, DnsError> {
        if let Some(cached) = self.cache.get(domain)
            && cached.expires_at > Instant::now()
        {
            debug!("Cache hit for {domain}, {} server(s)", cached.servers.len());
            return Ok(Arc::clone(&cached.servers));
        }

        let (servers, dns_ttl) = self.lookup(domain).await?;
        let servers = Arc::new(servers);
        let ttl = self.cache_ttl(dns_ttl);

        self.cache.insert(
            domain.clone(),
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + ttl,
            },
        );

        debug!(
            "Resolved {} server(s) for {domain}, DNS TTL {dns_ttl}s, cached for {}s",
            servers.len(),
            ttl.as_secs()
        );
        Ok(servers)
    }
}
