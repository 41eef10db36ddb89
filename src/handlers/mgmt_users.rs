//! RBAC REST API: local users, groups and the role listing.

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use serde::Serialize;

use super::{capture, cluster_of, on_http};
use crate::auth::{AuthError, Group, Permission, ROLES, UpsertUserOptions, User, UserRole};
use crate::hooks::HttpHooks;
use crate::logging::info;
use crate::services::http::ApiError;
use crate::services::{HttpRequest, HttpResponse, HttpService};

/// The only user domain the mock stores.
const LOCAL_DOMAIN: &str = "local";

pub(super) fn register(hooks: &HttpHooks) {
    on_http(hooks, Method::GET, "/settings/rbac/roles", list_roles);
    on_http(hooks, Method::GET, "/settings/rbac/users", list_users);
    on_http(hooks, Method::GET, "/settings/rbac/users/*", list_users);
    on_http(hooks, Method::GET, "/settings/rbac/users/*/*", get_user);
    on_http(hooks, Method::PUT, "/settings/rbac/users/*/*", upsert_user);
    on_http(hooks, Method::DELETE, "/settings/rbac/users/*/*", drop_user);
    on_http(hooks, Method::GET, "/settings/rbac/groups", list_groups);
    on_http(hooks, Method::GET, "/settings/rbac/groups/*", get_group);
    on_http(hooks, Method::PUT, "/settings/rbac/groups/*", upsert_group);
    on_http(hooks, Method::DELETE, "/settings/rbac/groups/*", drop_group);
}

#[derive(Debug, Serialize)]
struct JsonOrigin {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct JsonRole {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    collection_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    origins: Vec<JsonOrigin>,
}

impl JsonRole {
    fn new(role: &UserRole, origins: Vec<JsonOrigin>) -> Self {
        let qualifier = |part: &str| (!part.is_empty()).then(|| part.to_string());
        Self {
            role: role.name.clone(),
            bucket_name: qualifier(&role.bucket),
            scope_name: qualifier(&role.scope),
            collection_name: qualifier(&role.collection),
            origins,
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonUser {
    id: String,
    name: String,
    roles: Vec<JsonRole>,
    groups: Vec<String>,
    domain: &'static str,
}

#[derive(Debug, Serialize)]
struct JsonGroup {
    id: String,
    description: String,
    roles: Vec<JsonRole>,
}

#[derive(Debug, Serialize)]
struct JsonRoleInfo {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket_name: Option<&'static str>,
    name: &'static str,
    desc: &'static str,
}

/// A user with its own roles and the ones inherited from its groups.
fn user_json(user: &User, groups: &[Group]) -> JsonUser {
    let mut roles: Vec<JsonRole> = user
        .roles
        .iter()
        .map(|role| {
            JsonRole::new(
                role,
                vec![JsonOrigin {
                    kind: "user",
                    name: None,
                }],
            )
        })
        .collect();
    for group in groups.iter().filter(|g| user.groups.contains(&g.name)) {
        roles.extend(group.roles.iter().map(|role| {
            JsonRole::new(
                role,
                vec![JsonOrigin {
                    kind: "group",
                    name: Some(group.name.clone()),
                }],
            )
        }));
    }
    JsonUser {
        id: user.username.clone(),
        name: user.display_name.clone(),
        roles,
        groups: user.groups.clone(),
        domain: LOCAL_DOMAIN,
    }
}

fn group_json(group: &Group) -> JsonGroup {
    JsonGroup {
        id: group.name.clone(),
        description: group.description.clone(),
        roles: group.roles.iter().map(|role| JsonRole::new(role, Vec::new())).collect(),
    }
}

fn check_domain(domain: &str) -> Result<(), ApiError> {
    if domain == LOCAL_DOMAIN {
        Ok(())
    } else {
        Err(ApiError::not_found(format!("Unknown user domain: {domain}")))
    }
}

/// Role and group failures name the offending form field.
fn upsert_error(err: AuthError) -> ApiError {
    match err {
        AuthError::InvalidRole(role) | AuthError::UnknownRole(role) => ApiError::field(
            "roles",
            format!(
                "Cannot assign roles to user because the following roles are unknown, malformed or role parameters are undefined: [{role}]"
            ),
        ),
        AuthError::GroupNotFound(group) => ApiError::field("groups", format!("Groups do not exist: {group}")),
        other => other.into(),
    }
}

fn split_list(text: Option<&String>) -> Vec<String> {
    text.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn list_roles(service: &Arc<HttpService>, req: &HttpRequest, _captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::UserRead, "", "", "")?;
    let roles: Vec<JsonRoleInfo> = ROLES
        .iter()
        .map(|info| JsonRoleInfo {
            role: info.role,
            bucket_name: info.bucket_scoped.then_some("*"),
            name: info.name,
            desc: info.desc,
        })
        .collect();
    Ok(HttpResponse::json(StatusCode::OK, &roles)?)
}

fn list_users(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::UserRead, "", "", "")?;
    if let Some(domain) = captures.first() {
        check_domain(domain)?;
    }
    let (_, cluster) = cluster_of(service)?;
    let groups = cluster.auth().get_all_groups();
    let users: Vec<JsonUser> = cluster
        .auth()
        .get_all_users()
        .iter()
        .map(|user| user_json(user, &groups))
        .collect();
    Ok(HttpResponse::json(StatusCode::OK, &users)?)
}

fn get_user(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::UserRead, "", "", "")?;
    check_domain(capture(captures, 0))?;
    let (_, cluster) = cluster_of(service)?;
    let user = cluster
        .auth()
        .get_user(capture(captures, 1))
        .ok_or_else(|| ApiError::not_found("\"Unknown user.\""))?;
    let groups = cluster.auth().get_all_groups();
    Ok(HttpResponse::json(StatusCode::OK, &user_json(&user, &groups))?)
}

fn upsert_user(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::UserManage, "", "", "")?;
    check_domain(capture(captures, 0))?;
    let (_, cluster) = cluster_of(service)?;
    let form = req.form();
    let opts = UpsertUserOptions {
        username: capture(captures, 1).to_string(),
        display_name: form.get("name").cloned().unwrap_or_default(),
        password: form.get("password").cloned().unwrap_or_default(),
        roles: split_list(form.get("roles")),
        groups: split_list(form.get("groups")),
    };
    let user = cluster.auth().upsert_user(opts).map_err(upsert_error)?;
    info!(username = %user.username, "user upserted over rest");
    Ok(HttpResponse::empty(StatusCode::OK))
}

fn drop_user(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::UserManage, "", "", "")?;
    check_domain(capture(captures, 0))?;
    let (_, cluster) = cluster_of(service)?;
    cluster
        .auth()
        .drop_user(capture(captures, 1))
        .map_err(|_| ApiError::not_found("\"User was not found.\""))?;
    Ok(HttpResponse::empty(StatusCode::OK))
}

fn list_groups(service: &Arc<HttpService>, req: &HttpRequest, _captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::UserRead, "", "", "")?;
    let (_, cluster) = cluster_of(service)?;
    let groups: Vec<JsonGroup> = cluster.auth().get_all_groups().iter().map(group_json).collect();
    Ok(HttpResponse::json(StatusCode::OK, &groups)?)
}

fn get_group(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::UserRead, "", "", "")?;
    let (_, cluster) = cluster_of(service)?;
    let group = cluster
        .auth()
        .get_group(capture(captures, 0))
        .ok_or_else(|| ApiError::not_found("\"Unknown group.\""))?;
    Ok(HttpResponse::json(StatusCode::OK, &group_json(&group))?)
}

fn upsert_group(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::UserManage, "", "", "")?;
    let (_, cluster) = cluster_of(service)?;
    let form = req.form();
    let description = form.get("description").cloned().unwrap_or_default();
    cluster
        .auth()
        .upsert_group(capture(captures, 0), &description, &split_list(form.get("roles")))
        .map_err(upsert_error)?;
    Ok(HttpResponse::empty(StatusCode::OK))
}

fn drop_group(service: &Arc<HttpService>, req: &HttpRequest, captures: &[String]) -> Result<HttpResponse, ApiError> {
    service.require(req, Permission::UserManage, "", "", "")?;
    let (_, cluster) = cluster_of(service)?;
    cluster
        .auth()
        .drop_group(capture(captures, 0))
        .map_err(|_| ApiError::not_found("\"Group was not found.\""))?;
    Ok(HttpResponse::empty(StatusCode::OK))
}
