//! Role-tiered access policy table.
//!
//! # Table shape
//!
//! For every configured backend service the table holds four entries:
//!
//! | Pattern | Required roles |
//! |---------|----------------|
//! | `/{version}/admin/{service}/**` | admin role list |
//! | `/{version}/seller/{service}/**` | seller role list |
//! | `/{version}/member/{service}/**` | member role list |
//! | `/{version}/{service}/**` | none (any authenticated caller) |
//!
//! `service` is the configured service name lower-cased with the naming
//! suffix (usually `-service`) stripped, so `Catalog-Service` routes under
//! `/v1/catalog/**`.
//!
//! # Matching
//!
//! Matching is by whole path segments: `/v1/admin/catalog/**` matches
//! `/v1/admin/catalog` and `/v1/admin/catalog/items/7` but not
//! `/v1/admin/catalogue`. Entries are evaluated in order and the first match
//! wins. Construction rejects service names that would let two entries match
//! the same concrete path, so in practice at most one entry ever matches.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A privilege tier encoded in the second path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// `/{version}/admin/...`
    Admin,
    /// `/{version}/seller/...`
    Seller,
    /// `/{version}/member/...`
    Member,
}

impl Tier {
    /// All tiers, in table order.
    pub const ALL: [Tier; 3] = [Tier::Admin, Tier::Seller, Tier::Member];

    /// Path segment for this tier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Seller => "seller",
            Self::Member => "member",
        }
    }

    /// Parse a path segment into a tier.
    #[must_use]
    pub fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == segment)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role names accepted by each tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleSets {
    /// Roles allowed on `/{version}/admin/**`
    pub admin: Vec<String>,
    /// Roles allowed on `/{version}/seller/**`
    pub seller: Vec<String>,
    /// Roles allowed on `/{version}/member/**`
    pub member: Vec<String>,
}

impl RoleSets {
    /// Roles configured for a tier.
    #[must_use]
    pub fn for_tier(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::Admin => &self.admin,
            Tier::Seller => &self.seller,
            Tier::Member => &self.member,
        }
    }

    /// Whether `role` is configured for any tier. This union is the closed
    /// set of roles a token may carry.
    #[must_use]
    pub fn contains(&self, role: &str) -> bool {
        Tier::ALL
            .into_iter()
            .any(|tier| self.for_tier(tier).iter().any(|r| r == role))
    }
}

/// Errors raised while building the table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// The version prefix is empty or contains a slash.
    #[error("invalid route version prefix: {0:?}")]
    InvalidVersion(String),

    /// The service name reduces to an empty or multi-segment identifier.
    #[error("invalid service name: {0:?}")]
    InvalidService(String),

    /// Two configured names reduce to the same service identifier.
    #[error("service {name:?} duplicates route identifier {id:?}")]
    DuplicateService {
        /// Configured service name
        name: String,
        /// Identifier it reduced to
        id: String,
    },

    /// A role name is empty or not a printable ASCII token, so it could not
    /// travel in a header.
    #[error("invalid role name: {0:?}")]
    InvalidRole(String),

    /// A service identifier equals a tier name, which would make
    /// `/{version}/{tier}/...` ambiguous.
    #[error("service {name:?} collides with the {tier} tier prefix")]
    TierCollision {
        /// Configured service name
        name: String,
        /// Tier it collides with
        tier: Tier,
    },
}

/// One row of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    prefix: Vec<String>,
    service_name: String,
    service_id: String,
    tier: Option<Tier>,
    required_roles: BTreeSet<String>,
}

impl PolicyEntry {
    /// Human-readable pattern, e.g. `/v1/admin/catalog/**`.
    #[must_use]
    pub fn pattern(&self) -> String {
        format!("/{}/**", self.prefix.join("/"))
    }

    /// Configured backend service name (e.g. `catalog-service`).
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Route identifier derived from the service name (e.g. `catalog`).
    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Tier of this entry, `None` for the default route of a service.
    #[must_use]
    pub fn tier(&self) -> Option<Tier> {
        self.tier
    }

    /// Roles that may pass this entry, `None` when no role check applies.
    #[must_use]
    pub fn required_roles(&self) -> Option<&BTreeSet<String>> {
        self.tier.map(|_| &self.required_roles)
    }

    /// Whether a caller holding `role` passes this entry.
    ///
    /// Default entries admit every caller. Tiered entries require a role and
    /// require it to be in the tier's role set.
    #[must_use]
    pub fn permits(&self, role: Option<&str>) -> bool {
        match (self.tier, role) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(_), Some(role)) => self.required_roles.contains(role),
        }
    }

    fn matches(&self, segments: &[&str]) -> bool {
        segments.len() >= self.prefix.len()
            && self.prefix.iter().zip(segments).all(|(p, s)| p == s)
    }
}

/// Outcome of [`AccessPolicyTable::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The path is routed and the caller may reach it.
    Allow(Arc<PolicyEntry>),
    /// The path is routed but the caller's role is not permitted.
    Deny(Arc<PolicyEntry>),
    /// No entry matches the path.
    NoRoute,
}

impl Decision {
    /// Returns `true` for [`Decision::Allow`].
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

/// The read-only table built once at startup.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicyTable {
    entries: Vec<Arc<PolicyEntry>>,
    roles: RoleSets,
}

impl AccessPolicyTable {
    /// Build the table for `service_names` under `/{version}`.
    ///
    /// `suffix` is stripped from the lower-cased service name to obtain the
    /// route identifier.
    pub fn build(
        version: &str,
        suffix: &str,
        service_names: &[String],
        roles: &RoleSets,
    ) -> Result<Self, PolicyError> {
        let version = version.trim_matches('/');
        if version.is_empty() || version.contains('/') {
            return Err(PolicyError::InvalidVersion(version.to_string()));
        }

        for tier in Tier::ALL {
            if let Some(bad) = roles
                .for_tier(tier)
                .iter()
                .find(|r| r.is_empty() || !r.bytes().all(|b| b.is_ascii_graphic()))
            {
                return Err(PolicyError::InvalidRole(bad.clone()));
            }
        }

        let suffix = suffix.to_lowercase();
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(service_names.len() * 4);

        for name in service_names {
            let name = name.trim();
            let lowered = name.to_lowercase();
            let id = if suffix.is_empty() {
                lowered.as_str()
            } else {
                lowered.strip_suffix(suffix.as_str()).unwrap_or(&lowered)
            };

            if id.is_empty() || id.contains('/') || is_dot_segment(id) {
                return Err(PolicyError::InvalidService(name.to_string()));
            }
            if let Some(tier) = Tier::from_segment(id) {
                return Err(PolicyError::TierCollision {
                    name: name.to_string(),
                    tier,
                });
            }
            if !seen.insert(id.to_string()) {
                return Err(PolicyError::DuplicateService {
                    name: name.to_string(),
                    id: id.to_string(),
                });
            }

            for tier in Tier::ALL {
                entries.push(Arc::new(PolicyEntry {
                    prefix: vec![version.to_string(), tier.as_str().to_string(), id.to_string()],
                    service_name: name.to_string(),
                    service_id: id.to_string(),
                    tier: Some(tier),
                    required_roles: roles.for_tier(tier).iter().cloned().collect(),
                }));
            }
            entries.push(Arc::new(PolicyEntry {
                prefix: vec![version.to_string(), id.to_string()],
                service_name: name.to_string(),
                service_id: id.to_string(),
                tier: None,
                required_roles: BTreeSet::new(),
            }));
        }

        Ok(Self {
            entries,
            roles: roles.clone(),
        })
    }

    /// All entries in evaluation order.
    #[must_use]
    pub fn entries(&self) -> &[Arc<PolicyEntry>] {
        &self.entries
    }

    /// Whether `role` belongs to the configured role set.
    #[must_use]
    pub fn is_known_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no services are routed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry routing `path`, if any.
    ///
    /// Paths containing `.` or `..` segments (plain or percent-encoded) never
    /// match.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<Arc<PolicyEntry>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.iter().any(|s| is_dot_segment(s)) {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| entry.matches(&segments))
            .cloned()
    }

    /// Decide whether a caller with `role` may reach `path`.
    ///
    /// `role` must come from an already validated, non-revoked token.
    #[must_use]
    pub fn decide(&self, path: &str, role: Option<&str>) -> Decision {
        match self.resolve(path) {
            None => Decision::NoRoute,
            Some(entry) if entry.permits(role) => Decision::Allow(entry),
            Some(entry) => Decision::Deny(entry),
        }
    }
}

fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}
