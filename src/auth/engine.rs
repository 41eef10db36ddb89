//! User and group registry with role-based permission checks.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::error::AuthError;
use super::permission::{Permission, role_info};
use crate::logging::debug;

/// Username of the built-in administrator.
pub const DEFAULT_ADMIN_USER: &str = "Administrator";
/// Password of the built-in administrator.
pub const DEFAULT_ADMIN_PASSWORD: &str = "password";

/// A role assignment, optionally qualified with a bucket, scope and collection.
///
/// Empty qualifiers (or `*`) mean "any".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserRole {
    pub name: String,
    pub bucket: String,
    pub scope: String,
    pub collection: String,
}

impl UserRole {
    /// Unqualified role.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse `name` or `name[bucket]`, `name[bucket:scope]`, `name[bucket:scope:collection]`.
    pub fn parse(text: &str) -> Result<Self, AuthError> {
        let text = text.trim();
        let (name, qualifier) = match text.split_once('[') {
            None => (text, None),
            Some((name, rest)) => {
                let inner = rest
                    .strip_suffix(']')
                    .ok_or_else(|| AuthError::InvalidRole(text.to_string()))?;
                (name, Some(inner))
            }
        };

        if name.is_empty() {
            return Err(AuthError::InvalidRole(text.to_string()));
        }
        let info = role_info(name).ok_or_else(|| AuthError::UnknownRole(name.to_string()))?;

        let mut role = UserRole::new(name);
        if let Some(inner) = qualifier {
            if !info.bucket_scoped {
                return Err(AuthError::InvalidRole(text.to_string()));
            }
            let mut parts = inner.split(':');
            role.bucket = parts.next().unwrap_or_default().to_string();
            role.scope = parts.next().unwrap_or_default().to_string();
            role.collection = parts.next().unwrap_or_default().to_string();
            if parts.next().is_some() {
                return Err(AuthError::InvalidRole(text.to_string()));
            }
        }
        Ok(role)
    }

    /// Whether this assignment covers the requested resource.
    ///
    /// An empty requested component is satisfied by any role component.
    pub fn covers(&self, bucket: &str, scope: &str, collection: &str) -> bool {
        fn component(role: &str, requested: &str) -> bool {
            role.is_empty() || role == "*" || requested.is_empty() || role == requested
        }
        component(&self.bucket, bucket)
            && component(&self.scope, scope)
            && component(&self.collection, collection)
    }

    /// Whether this assignment grants `permission` on the requested resource.
    pub fn grants(&self, permission: Permission, bucket: &str, scope: &str, collection: &str) -> bool {
        let Some(info) = role_info(&self.name) else {
            return false;
        };
        info.permissions.contains(&permission) && self.covers(bucket, scope, collection)
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.bucket.is_empty() {
            write!(f, "[{}", self.bucket)?;
            if !self.scope.is_empty() {
                write!(f, ":{}", self.scope)?;
                if !self.collection.is_empty() {
                    write!(f, ":{}", self.collection)?;
                }
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// A stored user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub display_name: String,
    pub password: String,
    pub roles: Vec<UserRole>,
    pub groups: Vec<String>,
}

/// A named set of roles users can be assigned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub description: String,
    pub roles: Vec<UserRole>,
}

/// Input to [`AuthEngine::upsert_user`].
#[derive(Debug, Clone, Default)]
pub struct UpsertUserOptions {
    pub username: String,
    pub display_name: String,
    /// Empty keeps the existing password of an updated user.
    pub password: String,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
}

/// Thread-safe user and group registry.
#[derive(Debug)]
pub struct AuthEngine {
    users: RwLock<BTreeMap<String, User>>,
    groups: RwLock<BTreeMap<String, Group>>,
}

impl Default for AuthEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthEngine {
    /// Create a registry holding only the built-in administrator.
    pub fn new() -> Self {
        let admin = User {
            username: DEFAULT_ADMIN_USER.to_string(),
            display_name: "Administrator".to_string(),
            password: DEFAULT_ADMIN_PASSWORD.to_string(),
            roles: vec![UserRole::new("admin")],
            groups: Vec::new(),
        };
        let mut users = BTreeMap::new();
        users.insert(admin.username.clone(), admin);
        Self {
            users: RwLock::new(users),
            groups: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create or replace a user.
    pub fn upsert_user(&self, opts: UpsertUserOptions) -> Result<User, AuthError> {
        if opts.username.is_empty() {
            return Err(AuthError::MissingUsername);
        }
        let roles = opts
            .roles
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(UserRole::parse)
            .collect::<Result<Vec<_>, _>>()?;
        {
            let groups = self.groups.read();
            if let Some(missing) = opts.groups.iter().find(|g| !groups.contains_key(g.as_str())) {
                return Err(AuthError::GroupNotFound(missing.clone()));
            }
        }

        let mut users = self.users.write();
        let password = if opts.password.is_empty() {
            users
                .get(&opts.username)
                .map(|u| u.password.clone())
                .unwrap_or_default()
        } else {
            opts.password
        };
        let user = User {
            username: opts.username.clone(),
            display_name: opts.display_name,
            password,
            roles,
            groups: opts.groups,
        };
        debug!(username = %user.username, roles = user.roles.len(), "upserting user");
        users.insert(opts.username, user.clone());
        Ok(user)
    }

    pub fn get_user(&self, username: &str) -> Option<User> {
        self.users.read().get(username).cloned()
    }

    pub fn get_all_users(&self) -> Vec<User> {
        self.users.read().values().cloned().collect()
    }

    pub fn drop_user(&self, username: &str) -> Result<(), AuthError> {
        self.users
            .write()
            .remove(username)
            .map(|_| ())
            .ok_or_else(|| AuthError::UserNotFound(username.to_string()))
    }

    /// Create or replace a group.
    pub fn upsert_group(
        &self,
        name: &str,
        description: &str,
        roles: &[String],
    ) -> Result<Group, AuthError> {
        if name.is_empty() {
            return Err(AuthError::InvalidGroup(name.to_string()));
        }
        let roles = roles
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(UserRole::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let group = Group {
            name: name.to_string(),
            description: description.to_string(),
            roles,
        };
        self.groups.write().insert(group.name.clone(), group.clone());
        Ok(group)
    }

    pub fn get_group(&self, name: &str) -> Option<Group> {
        self.groups.read().get(name).cloned()
    }

    pub fn get_all_groups(&self) -> Vec<Group> {
        self.groups.read().values().cloned().collect()
    }

    /// Remove a group and detach it from every user.
    pub fn drop_group(&self, name: &str) -> Result<(), AuthError> {
        if self.groups.write().remove(name).is_none() {
            return Err(AuthError::GroupNotFound(name.to_string()));
        }
        for user in self.users.write().values_mut() {
            user.groups.retain(|g| g != name);
        }
        Ok(())
    }

    /// The stored password of a user, used by SCRAM.
    pub fn password(&self, username: &str) -> Option<String> {
        self.users.read().get(username).map(|u| u.password.clone())
    }

    /// Whether the user holds `permission` on the resource through a role or a group.
    pub fn has_permission(
        &self,
        username: &str,
        permission: Permission,
        bucket: &str,
        scope: &str,
        collection: &str,
    ) -> bool {
        let users = self.users.read();
        let Some(user) = users.get(username) else {
            return false;
        };
        if user
            .roles
            .iter()
            .any(|r| r.grants(permission, bucket, scope, collection))
        {
            return true;
        }
        let groups = self.groups.read();
        user.groups
            .iter()
            .filter_map(|g| groups.get(g))
            .flat_map(|g| g.roles.iter())
            .any(|r| r.grants(permission, bucket, scope, collection))
    }

    /// Check credentials only.
    pub fn check_password(&self, username: &str, password: &str) -> bool {
        self.users
            .read()
            .get(username)
            .is_some_and(|u| u.password == password)
    }

    /// Check credentials and a permission in one step.
    pub fn check_user_pass(
        &self,
        username: &str,
        password: &str,
        permission: Permission,
        bucket: &str,
        scope: &str,
        collection: &str,
    ) -> bool {
        self.check_password(username, password)
            && self.has_permission(username, permission, bucket, scope, collection)
    }
}
