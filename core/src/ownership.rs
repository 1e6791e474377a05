//! Ownership and scope enforcement for the document-lifecycle and
//! retrieval services.
//!
//! Token parsing and role assignment are out of scope for this crate (spec
//! §1, §6): callers already hold a resolved [`crate::model::Principal`]
//! bearing `(tenant_id, role)`. What remains in scope is the tenant-boundary
//! check every operation in C6/C7/C8 performs before touching a document,
//! chunk, or partition, plus the admin scope-widening rules §4.7 specifies
//! for the query path.

use crate::model::{Principal, Role};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthzError {
    #[error("tenant {caller} may not access resources owned by tenant {owner}")]
    NotOwner { caller: i64, owner: i64 },
}

/// Enforces invariant 3 (tenant isolation). Administrators may act on any
/// tenant's data; users are restricted to their own.
pub fn authorize_owner(principal: &Principal, owner_id: i64) -> Result<(), AuthzError> {
    if principal.is_admin() || principal.tenant_id == owner_id {
        Ok(())
    } else {
        Err(AuthzError::NotOwner {
            caller: principal.tenant_id,
            owner: owner_id,
        })
    }
}

/// The partition scope a query runs against (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// A single tenant's partition.
    Tenant(i64),
    /// No partition filter — every tenant's partition. Admin-only.
    All,
}

/// The `scope` query parameter as supplied by the caller, before it is
/// resolved against the principal's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestedScope {
    #[default]
    SelfScope,
    User(i64),
    All,
}

/// Resolves the effective partition scope for a query, per spec §4.7:
/// a user role always collapses to its own tenant regardless of what it
/// asked for; only an admin may widen scope.
pub fn resolve_query_scope(principal: &Principal, requested: RequestedScope) -> Scope {
    if !principal.is_admin() {
        return Scope::Tenant(principal.tenant_id);
    }

    match requested {
        RequestedScope::SelfScope => Scope::Tenant(principal.tenant_id),
        RequestedScope::User(uid) => Scope::Tenant(uid),
        RequestedScope::All => Scope::All,
    }
}
