//! Operator-configured delivery routes
//!
//! A route overrides MX resolution for one destination host. When several
//! routes match, the numerically lowest priority wins and ties go to the most
//! recently created route. Hosts without a route fall back to the
//! [`MxResolver`].
//!
//! Resolution happens on every attempt, so route changes apply to the next
//! attempt without a restart.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    net::IpAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;
use postern_common::Domain;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dns::{DnsError, MxResolver};

const DEFAULT_PRIORITY: u32 = 1;
const DEFAULT_PORT: u16 = 25;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Route not found: {0}")]
    NotFound(RouteId),

    #[error("Invalid route: {0}")]
    Config(String),
}

/// Route identifier, increasing in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(u64);

impl RouteId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The operator-supplied part of a route
///
/// ```ron
/// (host: "y.com", priority: Some(5), remote_host: Some("relay.example.net"))
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub host: Domain,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub local_ip: Option<IpAddr>,
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
}

impl RouteSpec {
    /// A route for `host` with every optional field unset
    #[must_use]
    pub fn new(host: impl AsRef<str>) -> Self {
        Self {
            host: Domain::new(host),
            priority: None,
            local_ip: None,
            remote_host: None,
            remote_port: None,
        }
    }

    fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref().map(str::trim)
    }

    fn effective_port(&self) -> u16 {
        self.remote_port.filter(|p| *p != 0).unwrap_or(DEFAULT_PORT)
    }

    /// Compared the way `add` stores them: trimmed remote host, port 0 as 25
    fn same_target(&self, route: &Route) -> bool {
        self.host == route.host
            && self.remote_host() == route.remote_host.as_deref()
            && self.effective_port() == route.effective_port()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub host: Domain,
    pub priority: Option<u32>,
    pub local_ip: Option<IpAddr>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
}

impl Route {
    /// Absent or zero priority counts as 1
    #[must_use]
    pub fn effective_priority(&self) -> u32 {
        self.priority.filter(|p| *p != 0).unwrap_or(DEFAULT_PRIORITY)
    }

    /// Absent or zero port counts as 25
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.remote_port.filter(|p| *p != 0).unwrap_or(DEFAULT_PORT)
    }

    /// Source address to bind to, `None` meaning the system default
    #[must_use]
    pub const fn bind_address(&self) -> Option<IpAddr> {
        self.local_ip
    }
}

/// The endpoint chosen for one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// `None` binds to the system default source address
    pub local_ip: Option<IpAddr>,
    pub remote_host: String,
    pub remote_port: u16,
    /// The route that matched, `None` when MX records were used
    pub route: Option<RouteId>,
}

impl ResolvedRoute {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

#[derive(Debug)]
pub struct RouteTable {
    routes: RwLock<BTreeMap<RouteId, Route>>,
    next_id: AtomicU64,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            routes: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from configured routes, in order
    ///
    /// # Errors
    /// Returns the first invalid route
    pub fn from_specs(specs: impl IntoIterator<Item = RouteSpec>) -> Result<Self, RouteError> {
        let table = Self::new();
        for spec in specs {
            table.add(spec)?;
        }
        Ok(table)
    }

    /// Add a route, or update the existing route with the same host and target
    ///
    /// # Errors
    /// Returns [`RouteError::Config`] for an empty host or remote host
    pub fn add(&self, spec: RouteSpec) -> Result<Route, RouteError> {
        if spec.host.is_empty() {
            return Err(RouteError::Config("host must not be empty".to_string()));
        }
        if spec.remote_host.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err(RouteError::Config(format!(
                "remote host for {} must not be empty",
                spec.host
            )));
        }

        let mut routes = self.routes.write();

        if let Some(existing) = routes.values_mut().find(|r| spec.same_target(r)) {
            existing.priority = spec.priority;
            existing.local_ip = spec.local_ip;
            existing.remote_port = spec.remote_port;
            return Ok(existing.clone());
        }

        let id = RouteId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let remote_host = spec.remote_host().map(str::to_string);
        let route = Route {
            id,
            host: spec.host,
            priority: spec.priority,
            local_ip: spec.local_ip,
            remote_host,
            remote_port: spec.remote_port,
        };
        routes.insert(id, route.clone());

        Ok(route)
    }

    /// # Errors
    /// Returns [`RouteError::NotFound`] for an unknown id
    pub fn del(&self, id: RouteId) -> Result<Route, RouteError> {
        self.routes.write().remove(&id).ok_or(RouteError::NotFound(id))
    }

    /// All routes by host, then effective priority, newest first among equals
    #[must_use]
    pub fn list(&self) -> Vec<Route> {
        let mut routes: Vec<_> = self.routes.read().values().cloned().collect();
        routes.sort_by(|a, b| {
            a.host
                .cmp(&b.host)
                .then(a.effective_priority().cmp(&b.effective_priority()))
                .then(b.id.cmp(&a.id))
        });
        routes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// The winning route for `host`, if any is configured
    #[must_use]
    pub fn select(&self, host: &Domain) -> Option<Route> {
        self.routes
            .read()
            .values()
            .filter(|r| &r.host == host)
            .min_by(|a, b| {
                a.effective_priority()
                    .cmp(&b.effective_priority())
                    .then(b.id.cmp(&a.id))
            })
            .cloned()
    }

    /// Resolve the endpoint for one attempt to `host`
    ///
    /// A matching route with a remote host is used as-is. A matching route
    /// without one keeps its source address and port but takes its target
    /// from the primary MX of `host`. Without a route, the primary MX is used
    /// on port 25 from the default source address.
    ///
    /// # Errors
    /// Propagates the [`DnsError`] when MX resolution is needed and fails
    pub async fn resolve(
        &self,
        host: &Domain,
        mx: &dyn MxResolver,
    ) -> Result<ResolvedRoute, DnsError> {
        let route = self.select(host);

        if let Some(route) = &route
            && let Some(remote_host) = &route.remote_host
        {
            return Ok(ResolvedRoute {
                local_ip: route.bind_address(),
                remote_host: remote_host.clone(),
                remote_port: route.effective_port(),
                route: Some(route.id),
            });
        }

        let servers = mx.resolve_mail_servers(host).await?;
        let primary = servers
            .first()
            .ok_or_else(|| DnsError::NoMailServers(host.to_string()))?;

        Ok(match route {
            Some(route) => ResolvedRoute {
                local_ip: route.bind_address(),
                remote_host: primary.host.clone(),
                remote_port: route.effective_port(),
                route: Some(route.id),
            },
            None => ResolvedRoute {
                local_ip: None,
                remote_host: primary.host.clone(),
                remote_port: primary.port,
                route: None,
            },
        })
    }
}
