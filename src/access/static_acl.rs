//! Configuration-backed access control.

use super::{AccessControl, HostDirectory};
use crate::core::config::{Config, IdentityConfig};
use crate::core::error::{HostplaneError, HostplaneResult};
use crate::core::ids::{AccountId, HostId, Identity};
use crate::invalidate::Scope;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use std::collections::HashMap;

/// Grants of one identity.
#[derive(Debug, Clone)]
pub struct IdentityGrant {
    pub identity: Identity,
    /// Argon2 PHC string.
    pub password_hash: String,
    pub privileged: bool,
    pub can_switch_users: bool,
    pub accounts: Scope<AccountId>,
    pub hosts: Scope<HostId>,
}

impl From<&IdentityConfig> for IdentityGrant {
    fn from(config: &IdentityConfig) -> Self {
        let accounts = if config.accounts.iter().any(|account| account == "*") {
            Scope::All
        } else {
            Scope::only(config.accounts.iter().map(String::as_str))
        };
        let hosts = if config.all_hosts {
            Scope::All
        } else {
            Scope::only(config.hosts.iter().copied())
        };
        Self {
            identity: Identity(config.name.clone()),
            password_hash: config.password_hash.clone(),
            privileged: config.privileged,
            can_switch_users: config.can_switch_users,
            accounts,
            hosts,
        }
    }
}

/// Access control and host directory served from static tables.
#[derive(Debug, Default)]
pub struct StaticAccessControl {
    grants: HashMap<Identity, IdentityGrant>,
    hostnames: HashMap<String, HostId>,
}

impl StaticAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[[hosts]]` and `[[identities]]` sections.
    pub fn from_config(config: &Config) -> Self {
        let mut acl = Self::new();
        for host in &config.hosts {
            acl = acl.with_host(HostId(host.id), host.hostname.clone());
        }
        for identity in &config.identities {
            acl = acl.with_grant(IdentityGrant::from(identity));
        }
        acl
    }

    pub fn with_host(mut self, id: HostId, hostname: impl Into<String>) -> Self {
        self.hostnames.insert(hostname.into(), id);
        self
    }

    pub fn with_grant(mut self, grant: IdentityGrant) -> Self {
        self.grants.insert(grant.identity.clone(), grant);
        self
    }

    fn grant(&self, identity: &Identity) -> Option<&IdentityGrant> {
        self.grants.get(identity)
    }
}

impl AccessControl for StaticAccessControl {
    fn authenticate(&self, identity: &Identity, credential: &str) -> HostplaneResult<()> {
        let Some(grant) = self.grant(identity) else {
            return Err(HostplaneError::authentication_failed("invalid identity or credential"));
        };
        verify_credential(identity, credential, &grant.password_hash)
    }

    fn can_switch_users(&self, authenticated: &Identity, effective: &Identity) -> bool {
        if authenticated == effective {
            return true;
        }
        self.grant(authenticated)
            .is_some_and(|grant| grant.can_switch_users)
            && self.grants.contains_key(effective)
    }

    fn is_privileged(&self, identity: &Identity) -> bool {
        self.grant(identity).is_some_and(|grant| grant.privileged)
    }

    fn can_access_account(&self, identity: &Identity, account: &AccountId) -> bool {
        self.grant(identity)
            .is_some_and(|grant| grant.accounts.contains(account))
    }

    fn can_access_host(&self, identity: &Identity, host: HostId) -> bool {
        self.grant(identity)
            .is_some_and(|grant| grant.hosts.contains(&host))
    }
}

/// Hash `password` with Argon2id into a PHC string for `password_hash`.
pub fn hash_credential(password: &str, memory_kib: u32, iterations: u32) -> HostplaneResult<String> {
    let params = Params::new(memory_kib, iterations, 1, None)
        .map_err(|err| HostplaneError::internal(format!("invalid hash parameters: {}", err)))?;
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| HostplaneError::internal(format!("failed to hash credential: {}", err)))
}

// Parameters come from the stored hash, not from `Argon2::default()`.
fn verify_credential(identity: &Identity, credential: &str, stored: &str) -> HostplaneResult<()> {
    let parsed = match PasswordHash::new(stored) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(identity = %identity, error = %err, "unusable credential hash");
            return Err(HostplaneError::authentication_failed(
                "invalid identity or credential",
            ));
        }
    };
    Argon2::default()
        .verify_password(credential.as_bytes(), &parsed)
        .map_err(|_| HostplaneError::authentication_failed("invalid identity or credential"))
}

impl HostDirectory for StaticAccessControl {
    fn resolve_hostname(&self, hostname: &str) -> Option<HostId> {
        self.hostnames.get(hostname).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(name: &str, password: &str) -> IdentityGrant {
        IdentityGrant {
            identity: Identity::from(name),
            password_hash: hash_credential(password, 256, 1).unwrap(),
            privileged: false,
            can_switch_users: false,
            accounts: Scope::only(["acme"]),
            hosts: Scope::only([10u32]),
        }
    }

    #[test]
    fn authenticate_checks_credential_hash() {
        let acl = StaticAccessControl::new().with_grant(grant("alice", "s3cret"));
        let alice = Identity::from("alice");
        assert!(acl.authenticate(&alice, "s3cret").is_ok());
        assert!(matches!(
            acl.authenticate(&alice, "wrong"),
            Err(HostplaneError::AuthenticationFailed { .. })
        ));
        assert!(acl.authenticate(&Identity::from("mallory"), "s3cret").is_err());
    }

    #[test]
    fn impersonation_requires_permission() {
        let mut admin = grant("admin", "pw");
        admin.can_switch_users = true;
        let acl = StaticAccessControl::new()
            .with_grant(admin)
            .with_grant(grant("alice", "pw"));

        let admin = Identity::from("admin");
        let alice = Identity::from("alice");
        assert!(acl.can_switch_users(&admin, &alice));
        assert!(!acl.can_switch_users(&alice, &admin));
        assert!(acl.can_switch_users(&alice, &alice));
        assert!(!acl.can_switch_users(&admin, &Identity::from("nobody")));
    }

    #[test]
    fn from_config_maps_wildcards() {
        let config = Config::from_toml(
            r#"
[[hosts]]
id = 10
hostname = "web1.example.net"

[[identities]]
name = "root"
password_hash = "x"
privileged = true
accounts = ["*"]
all_hosts = true

[[identities]]
name = "alice"
password_hash = "x"
accounts = ["acme"]
hosts = [10]
"#,
        )
        .unwrap();
        let acl = StaticAccessControl::from_config(&config);

        let root = Identity::from("root");
        let alice = Identity::from("alice");
        assert!(acl.is_privileged(&root));
        assert!(!acl.is_privileged(&alice));
        assert!(acl.can_access_account(&root, &AccountId::from("beta")));
        assert!(acl.can_access_host(&root, HostId(99)));
        assert!(acl.can_access_account(&alice, &AccountId::from("acme")));
        assert!(!acl.can_access_account(&alice, &AccountId::from("beta")));
        assert!(acl.can_access_host(&alice, HostId(10)));
        assert_eq!(acl.resolve_hostname("web1.example.net"), Some(HostId(10)));
        assert_eq!(acl.resolve_hostname("web2.example.net"), None);
    }
}
