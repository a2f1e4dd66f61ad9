//! Authorization gate consumed by every endpoint.
//!
//! Session issuance and membership data live outside this crate; the server
//! only talks to them through [`AccessControl`]. [`StaticAccessControl`] is an
//! in-memory implementation loaded from a JSON file, used by the server binary
//! and the tests.

use axum::http::{header, HeaderMap};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use crate::error::SyncError;
use crate::protocol::DocumentId;

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// Authorization boundary (e.g. an organization) owning documents.
pub type ScopeId = String;

/// External authentication/authorization collaborator.
pub trait AccessControl: Send + Sync {
    /// Resolve the caller from the inbound request headers.
    fn resolve_principal(&self, headers: &HeaderMap) -> Option<Principal>;

    /// Whether `principal` belongs to `scope`.
    fn is_member(&self, principal: &Principal, scope: &str) -> bool;

    /// The scope owning `doc_id`, or `None` if the document is unknown.
    fn scope_of(&self, doc_id: DocumentId) -> Option<ScopeId>;
}

/// Resolve the caller, failing with `Unauthenticated` when there is none.
pub fn authenticate(access: &dyn AccessControl, headers: &HeaderMap) -> Result<Principal, SyncError> {
    access
        .resolve_principal(headers)
        .ok_or(SyncError::Unauthenticated)
}

/// Check that `principal` may read and write `doc_id`.
///
/// Runs on every request, including every (re)subscription to a change feed:
/// the feed filter is a plain equality on the caller-supplied document id.
pub fn authorize_document(
    access: &dyn AccessControl,
    principal: &Principal,
    doc_id: DocumentId,
) -> Result<ScopeId, SyncError> {
    let scope = access
        .scope_of(doc_id)
        .ok_or_else(|| SyncError::NotFound(format!("document {doc_id}")))?;
    if !access.is_member(principal, &scope) {
        log::debug!("{} is not a member of scope {scope} (document {doc_id})", principal.0);
        return Err(SyncError::Forbidden);
    }
    Ok(scope)
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// File format for [`StaticAccessControl::load`].
///
/// ```json
/// {
///   "sessions":  { "token-a": "alice" },
///   "scopes":    { "acme": ["alice"] },
///   "documents": { "6f1c…": "acme" }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessTable {
    #[serde(default)]
    pub sessions: HashMap<String, Principal>,
    #[serde(default)]
    pub scopes: HashMap<ScopeId, HashSet<Principal>>,
    #[serde(default)]
    pub documents: HashMap<DocumentId, ScopeId>,
}

/// Bearer-token sessions, scope memberships and document ownership held in
/// memory.
#[derive(Debug, Default)]
pub struct StaticAccessControl {
    table: RwLock<AccessTable>,
}

impl StaticAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: AccessTable) -> Self {
        Self { table: RwLock::new(table) }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::from_table(serde_json::from_str(json)?))
    }

    /// Load the access table from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let access = Self::from_json(&raw)?;
        log::info!("Loaded access table from {}", path.as_ref().display());
        Ok(access)
    }

    pub fn add_session(&self, token: impl Into<String>, principal: Principal) {
        self.write().sessions.insert(token.into(), principal);
    }

    pub fn revoke_session(&self, token: &str) {
        self.write().sessions.remove(token);
    }

    pub fn add_member(&self, scope: impl Into<ScopeId>, principal: Principal) {
        self.write().scopes.entry(scope.into()).or_default().insert(principal);
    }

    pub fn remove_member(&self, scope: &str, principal: &Principal) {
        if let Some(members) = self.write().scopes.get_mut(scope) {
            members.remove(principal);
        }
    }

    pub fn assign_document(&self, doc_id: DocumentId, scope: impl Into<ScopeId>) {
        self.write().documents.insert(doc_id, scope.into());
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AccessTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AccessTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AccessControl for StaticAccessControl {
    fn resolve_principal(&self, headers: &HeaderMap) -> Option<Principal> {
        let token = bearer_token(headers)?;
        self.read().sessions.get(token).cloned()
    }

    fn is_member(&self, principal: &Principal, scope: &str) -> bool {
        self.read()
            .scopes
            .get(scope)
            .is_some_and(|members| members.contains(principal))
    }

    fn scope_of(&self, doc_id: DocumentId) -> Option<ScopeId> {
        self.read().documents.get(&doc_id).cloned()
    }
}
