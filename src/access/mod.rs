//! Authorization collaborators.
//!
//! The core never decides policy itself. Authentication, impersonation and
//! account/host reachability are answered by an [`AccessControl`]
//! implementation, and daemon hostnames are resolved through a
//! [`HostDirectory`]. [`StaticAccessControl`] serves both from the
//! configuration file so the server can run stand-alone.

mod host_cache;
mod static_acl;

pub use host_cache::HostLookupCache;
pub use static_acl::{hash_credential, IdentityGrant, StaticAccessControl};

use crate::core::error::HostplaneResult;
use crate::core::ids::{AccountId, HostId, Identity};

/// Authorization policy consulted by the handshake and the fan-out filter.
pub trait AccessControl: Send + Sync {
    /// Verify a credential for `identity`.
    ///
    /// Handshakes call this from the blocking pool, so slow password
    /// hashing does not hold up other connections.
    fn authenticate(&self, identity: &Identity, credential: &str) -> HostplaneResult<()>;

    /// Check whether `authenticated` may act as `effective`.
    fn can_switch_users(&self, authenticated: &Identity, effective: &Identity) -> bool;

    /// Check whether `identity` may bind daemons and wait on barriers.
    fn is_privileged(&self, identity: &Identity) -> bool;

    /// Check whether `identity` can see `account`.
    fn can_access_account(&self, identity: &Identity, account: &AccountId) -> bool;

    /// Check whether `identity` can see `host`.
    fn can_access_host(&self, identity: &Identity, host: HostId) -> bool;
}

/// Hostname to host id resolution.
pub trait HostDirectory: Send + Sync {
    fn resolve_hostname(&self, hostname: &str) -> Option<HostId>;
}
