//! Role and permission engine
//!
//! Permission identity is `resource.action`. Roles carry a permission set
//! and an inherits-from set; a role's effective permissions are the fixed
//! point of the inheritance relation, computed by DFS and memoised. System
//! roles and permissions are immutable seeds.

use crate::auth::permission_matches;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    User,
    Agent,
    Knowledge,
    Model,
    System,
    Gateway,
    File,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Read,
    Write,
    Delete,
    Admin,
    Execute,
}

/// A named permission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub name: String,
    pub resource: ResourceType,
    pub action: ActionType,
    pub description: String,
    pub is_system: bool,
}

/// A role: direct permissions plus inherited roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub permissions: HashSet<String>,
    pub inherits_from: HashSet<String>,
    pub is_system: bool,
}

#[derive(Default)]
struct EngineInner {
    permissions: HashMap<String, Permission>,
    roles: HashMap<String, Role>,
    /// Memoised effective-permission closures, cleared on any mutation.
    closure_cache: HashMap<String, HashSet<String>>,
}

/// The permission engine shared across planes.
pub struct PermissionEngine {
    inner: RwLock<EngineInner>,
}

impl PermissionEngine {
    pub fn new() -> Self {
        let mut inner = EngineInner::default();
        seed_permissions(&mut inner.permissions);
        seed_roles(&mut inner.roles, &inner.permissions);
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub async fn create_permission(
        &self,
        name: &str,
        resource: ResourceType,
        action: ActionType,
        description: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.permissions.contains_key(name) {
            return Err(GatewayError::bad_request(format!(
                "permission already exists: {}",
                name
            )));
        }
        inner.permissions.insert(
            name.to_string(),
            Permission {
                name: name.to_string(),
                resource,
                action,
                description: description.to_string(),
                is_system: false,
            },
        );
        inner.closure_cache.clear();
        info!(permission = %name, "created permission");
        Ok(())
    }

    pub async fn create_role(
        &self,
        name: &str,
        display_name: &str,
        description: &str,
        permissions: Vec<String>,
        inherits_from: Vec<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.roles.contains_key(name) {
            return Err(GatewayError::bad_request(format!(
                "role already exists: {}",
                name
            )));
        }
        for permission in &permissions {
            if !inner.permissions.contains_key(permission) {
                return Err(GatewayError::bad_request(format!(
                    "unknown permission: {}",
                    permission
                )));
            }
        }
        for parent in &inherits_from {
            if !inner.roles.contains_key(parent) {
                return Err(GatewayError::bad_request(format!(
                    "unknown parent role: {}",
                    parent
                )));
            }
        }
        if would_introduce_cycle(&inner.roles, name, &inherits_from) {
            warn!(role = %name, "rejected role creating an inheritance cycle");
            return Err(GatewayError::bad_request(format!(
                "role {} would introduce an inheritance cycle",
                name
            )));
        }

        inner.roles.insert(
            name.to_string(),
            Role {
                name: name.to_string(),
                display_name: display_name.to_string(),
                description: description.to_string(),
                permissions: permissions.into_iter().collect(),
                inherits_from: inherits_from.into_iter().collect(),
                is_system: false,
            },
        );
        inner.closure_cache.clear();
        info!(role = %name, "created role");
        Ok(())
    }

    /// Effective permissions of a role: its own plus everything inherited.
    /// Unknown roles resolve to the empty set.
    pub async fn role_permissions(&self, role_name: &str) -> HashSet<String> {
        {
            let inner = self.inner.read().await;
            if let Some(cached) = inner.closure_cache.get(role_name) {
                return cached.clone();
            }
        }

        let mut inner = self.inner.write().await;
        let closure = compute_closure(&inner.roles, role_name);
        inner
            .closure_cache
            .insert(role_name.to_string(), closure.clone());
        closure
    }

    /// All permissions a subject holds: role closures plus direct grants.
    pub async fn subject_permissions(
        &self,
        roles: &[String],
        direct: &[String],
    ) -> HashSet<String> {
        let mut all: HashSet<String> = direct.iter().cloned().collect();
        for role in roles {
            all.extend(self.role_permissions(role).await);
        }
        all
    }

    /// Permission check with `prefix:*` wildcard support.
    pub async fn check_permission(
        &self,
        roles: &[String],
        direct: &[String],
        required: &str,
    ) -> bool {
        self.subject_permissions(roles, direct)
            .await
            .iter()
            .any(|granted| permission_matches(granted, required))
    }

    pub async fn update_role_permissions(
        &self,
        role_name: &str,
        permissions: Vec<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        for permission in &permissions {
            if !inner.permissions.contains_key(permission) {
                return Err(GatewayError::bad_request(format!(
                    "unknown permission: {}",
                    permission
                )));
            }
        }
        let role = inner
            .roles
            .get_mut(role_name)
            .ok_or_else(|| GatewayError::not_found(format!("role {}", role_name)))?;
        if role.is_system {
            return Err(GatewayError::permission_denied(format!(
                "system role {} is immutable",
                role_name
            )));
        }
        role.permissions = permissions.into_iter().collect();
        inner.closure_cache.clear();
        Ok(())
    }

    pub async fn delete_permission(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let permission = inner
            .permissions
            .get(name)
            .ok_or_else(|| GatewayError::not_found(format!("permission {}", name)))?;
        if permission.is_system {
            return Err(GatewayError::permission_denied(format!(
                "system permission {} is immutable",
                name
            )));
        }
        for role in inner.roles.values_mut() {
            role.permissions.remove(name);
        }
        inner.permissions.remove(name);
        inner.closure_cache.clear();
        Ok(())
    }

    pub async fn delete_role(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let role = inner
            .roles
            .get(name)
            .ok_or_else(|| GatewayError::not_found(format!("role {}", name)))?;
        if role.is_system {
            return Err(GatewayError::permission_denied(format!(
                "system role {} is immutable",
                name
            )));
        }
        if inner
            .roles
            .values()
            .any(|other| other.inherits_from.contains(name))
        {
            return Err(GatewayError::bad_request(format!(
                "role {} is inherited by another role",
                name
            )));
        }
        inner.roles.remove(name);
        inner.closure_cache.clear();
        Ok(())
    }

    pub async fn get_role(&self, name: &str) -> Option<Role> {
        self.inner.read().await.roles.get(name).cloned()
    }

    pub async fn get_permission(&self, name: &str) -> Option<Permission> {
        self.inner.read().await.permissions.get(name).cloned()
    }

    pub async fn stats(&self) -> serde_json::Value {
        let inner = self.inner.read().await;
        let system_permissions = inner.permissions.values().filter(|p| p.is_system).count();
        let system_roles = inner.roles.values().filter(|r| r.is_system).count();
        serde_json::json!({
            "total_permissions": inner.permissions.len(),
            "system_permissions": system_permissions,
            "custom_permissions": inner.permissions.len() - system_permissions,
            "total_roles": inner.roles.len(),
            "system_roles": system_roles,
            "custom_roles": inner.roles.len() - system_roles,
            "cache_size": inner.closure_cache.len(),
        })
    }
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// DFS closure with a visited set; tolerates (and breaks) accidental cycles
/// already present in the graph.
fn compute_closure(roles: &HashMap<String, Role>, role_name: &str) -> HashSet<String> {
    let mut permissions = HashSet::new();
    let mut visited = HashSet::new();
    let mut stack = vec![role_name.to_string()];

    while let Some(current) = stack.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        if let Some(role) = roles.get(&current) {
            permissions.extend(role.permissions.iter().cloned());
            stack.extend(role.inherits_from.iter().cloned());
        }
    }
    permissions
}

/// Would a new role `name` with the given parents close a cycle back to
/// itself through existing inheritance edges?
fn would_introduce_cycle(
    roles: &HashMap<String, Role>,
    name: &str,
    inherits_from: &[String],
) -> bool {
    let mut stack: Vec<&str> = inherits_from.iter().map(String::as_str).collect();
    let mut visited = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == name {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(role) = roles.get(current) {
            stack.extend(role.inherits_from.iter().map(String::as_str));
        }
    }
    false
}

fn seed_permissions(permissions: &mut HashMap<String, Permission>) {
    let defaults = [
        ("user.read", ResourceType::User, ActionType::Read, "View user accounts"),
        ("user.write", ResourceType::User, ActionType::Write, "Modify user accounts"),
        ("user.delete", ResourceType::User, ActionType::Delete, "Delete user accounts"),
        ("user.admin", ResourceType::User, ActionType::Admin, "Administer users"),
        ("agent.read", ResourceType::Agent, ActionType::Read, "View agents"),
        ("agent.write", ResourceType::Agent, ActionType::Write, "Modify agents"),
        ("agent.delete", ResourceType::Agent, ActionType::Delete, "Delete agents"),
        ("agent.execute", ResourceType::Agent, ActionType::Execute, "Execute agents"),
        ("knowledge.read", ResourceType::Knowledge, ActionType::Read, "View knowledge bases"),
        ("knowledge.write", ResourceType::Knowledge, ActionType::Write, "Modify knowledge bases"),
        ("knowledge.delete", ResourceType::Knowledge, ActionType::Delete, "Delete knowledge bases"),
        ("model.read", ResourceType::Model, ActionType::Read, "View model configuration"),
        ("model.write", ResourceType::Model, ActionType::Write, "Modify model configuration"),
        ("model.execute", ResourceType::Model, ActionType::Execute, "Invoke models"),
        ("system.read", ResourceType::System, ActionType::Read, "View system information"),
        ("system.write", ResourceType::System, ActionType::Write, "Modify system configuration"),
        ("system.admin", ResourceType::System, ActionType::Admin, "Administer the system"),
        ("gateway.read", ResourceType::Gateway, ActionType::Read, "View gateway state"),
        ("gateway.write", ResourceType::Gateway, ActionType::Write, "Modify gateway configuration"),
        ("gateway.admin", ResourceType::Gateway, ActionType::Admin, "Administer the gateway"),
        ("file.read", ResourceType::File, ActionType::Read, "View files"),
        ("file.write", ResourceType::File, ActionType::Write, "Upload and modify files"),
        ("file.delete", ResourceType::File, ActionType::Delete, "Delete files"),
        ("task.read", ResourceType::Task, ActionType::Read, "View tasks"),
        ("task.write", ResourceType::Task, ActionType::Write, "Create and modify tasks"),
        ("task.execute", ResourceType::Task, ActionType::Execute, "Execute tasks"),
        ("task.admin", ResourceType::Task, ActionType::Admin, "Administer tasks"),
    ];

    for (name, resource, action, description) in defaults {
        permissions.insert(
            name.to_string(),
            Permission {
                name: name.to_string(),
                resource,
                action,
                description: description.to_string(),
                is_system: true,
            },
        );
    }
}

fn seed_roles(roles: &mut HashMap<String, Role>, permissions: &HashMap<String, Permission>) {
    let all: HashSet<String> = permissions.keys().cloned().collect();

    let mut insert = |name: &str, display: &str, description: &str, perms: HashSet<String>| {
        roles.insert(
            name.to_string(),
            Role {
                name: name.to_string(),
                display_name: display.to_string(),
                description: description.to_string(),
                permissions: perms,
                inherits_from: HashSet::new(),
                is_system: true,
            },
        );
    };

    insert("admin", "Administrator", "All permissions", all.clone());
    insert(
        "user",
        "User",
        "Baseline user permissions",
        [
            "user.read",
            "agent.read",
            "agent.execute",
            "knowledge.read",
            "model.read",
            "model.execute",
            "file.read",
            "file.write",
            "task.read",
            "task.write",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
    );
    insert(
        "developer",
        "Developer",
        "Manage agents and knowledge bases",
        [
            "user.read",
            "agent.read",
            "agent.write",
            "agent.execute",
            "knowledge.read",
            "knowledge.write",
            "model.read",
            "model.execute",
            "file.read",
            "file.write",
            "file.delete",
            "task.read",
            "task.write",
            "task.execute",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
    );
    insert(
        "readonly",
        "Read-only",
        "View-only access",
        [
            "user.read",
            "agent.read",
            "knowledge.read",
            "model.read",
            "file.read",
            "task.read",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
    );
    insert(
        "api_user",
        "API user",
        "External API access",
        [
            "agent.read",
            "agent.execute",
            "knowledge.read",
            "model.execute",
            "file.read",
            "file.write",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
    );
    insert(
        "internal_service",
        "Internal service",
        "Service-to-service access",
        all,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_seeds_present() {
        let engine = PermissionEngine::new();
        assert!(engine.get_permission("agent.execute").await.is_some());
        let admin = engine.get_role("admin").await.unwrap();
        assert!(admin.is_system);
        assert!(admin.permissions.contains("system.admin"));
    }

    #[tokio::test]
    async fn test_inheritance_closure() {
        let engine = PermissionEngine::new();
        engine
            .create_role("operator", "Operator", "Inherits readonly", vec![], vec!["readonly".into()])
            .await
            .unwrap();
        engine
            .create_role(
                "senior-operator",
                "Senior operator",
                "Operator plus task execution",
                vec!["task.execute".into()],
                vec!["operator".into()],
            )
            .await
            .unwrap();

        let effective = engine.role_permissions("senior-operator").await;
        assert!(effective.contains("task.execute"));
        assert!(effective.contains("agent.read")); // via readonly
        assert!(!effective.contains("agent.write"));
    }

    #[tokio::test]
    async fn test_closure_is_memoised_and_invalidated() {
        let engine = PermissionEngine::new();
        engine.role_permissions("user").await;
        assert_eq!(engine.stats().await["cache_size"], 1);

        engine
            .create_permission("report.read", ResourceType::System, ActionType::Read, "Reports")
            .await
            .unwrap();
        assert_eq!(engine.stats().await["cache_size"], 0);
    }

    #[tokio::test]
    async fn test_cycle_refused_on_create() {
        let engine = PermissionEngine::new();
        engine
            .create_role("a", "A", "", vec![], vec![])
            .await
            .unwrap();
        engine
            .create_role("b", "B", "", vec![], vec!["a".into()])
            .await
            .unwrap();

        // a ← b already exists; creating "a" again fails as duplicate, and a
        // self-referential role is refused outright.
        assert!(engine
            .create_role("c", "C", "", vec![], vec!["c".into()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_subject_permissions_union_roles_and_direct() {
        let engine = PermissionEngine::new();
        let permitted = engine
            .check_permission(&["readonly".into()], &[], "agent.read")
            .await;
        assert!(permitted);

        let denied = engine
            .check_permission(&["readonly".into()], &[], "agent.write")
            .await;
        assert!(!denied);

        let direct = engine
            .check_permission(&[], &["agent.write".into()], "agent.write")
            .await;
        assert!(direct);
    }

    #[tokio::test]
    async fn test_wildcard_direct_grant() {
        let engine = PermissionEngine::new();
        assert!(
            engine
                .check_permission(&[], &["system:*".into()], "system:tasks")
                .await
        );
    }

    #[tokio::test]
    async fn test_system_entities_immutable() {
        let engine = PermissionEngine::new();
        assert!(engine.delete_role("admin").await.is_err());
        assert!(engine.delete_permission("agent.read").await.is_err());
        assert!(engine
            .update_role_permissions("user", vec!["agent.read".into()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_referenced_role_cannot_be_deleted() {
        let engine = PermissionEngine::new();
        engine
            .create_role("base", "Base", "", vec![], vec![])
            .await
            .unwrap();
        engine
            .create_role("derived", "Derived", "", vec![], vec!["base".into()])
            .await
            .unwrap();

        assert!(engine.delete_role("base").await.is_err());
        engine.delete_role("derived").await.unwrap();
        engine.delete_role("base").await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_parent_or_permission_rejected() {
        let engine = PermissionEngine::new();
        assert!(engine
            .create_role("x", "X", "", vec!["missing.permission".into()], vec![])
            .await
            .is_err());
        assert!(engine
            .create_role("y", "Y", "", vec![], vec!["missing-role".into()])
            .await
            .is_err());
    }
}
