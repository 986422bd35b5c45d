//! Permission model: `resource`/`action` pairs with `*` wildcards and
//! optional condition maps that must match a subset of the request context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conditions: BTreeMap<String, String>,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            conditions: BTreeMap::new(),
        }
    }

    /// Full access.
    pub fn wildcard() -> Self {
        Self::new("*", "*")
    }

    pub fn with_condition(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.insert(key.into(), value.into());
        self
    }
}

/// Whether `permission` grants `action` on `resource` given the request
/// `context`.  Every permission condition must be present and equal in the
/// context; the context may carry extra keys.
pub fn permission_matches(
    permission: &Permission,
    resource: &str,
    action: &str,
    context: &BTreeMap<String, String>,
) -> bool {
    let resource_ok = permission.resource == "*" || permission.resource == resource;
    let action_ok = permission.action == "*" || permission.action == action;
    if !resource_ok || !action_ok {
        return false;
    }

    permission
        .conditions
        .iter()
        .all(|(key, expected)| context.get(key).map(|v| v == expected).unwrap_or(false))
}

/// First-match check across a permission list.
pub fn any_permission_matches(
    permissions: &[Permission],
    resource: &str,
    action: &str,
    context: &BTreeMap<String, String>,
) -> bool {
    permissions
        .iter()
        .any(|p| permission_matches(p, resource, action, context))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_context() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn exact_match_grants() {
        let p = Permission::new("memory", "read");
        assert!(permission_matches(&p, "memory", "read", &no_context()));
        assert!(!permission_matches(&p, "memory", "write", &no_context()));
        assert!(!permission_matches(&p, "tools", "read", &no_context()));
    }

    #[test]
    fn wildcards_match_anything() {
        let p = Permission::wildcard();
        assert!(permission_matches(&p, "memory", "write", &no_context()));
        assert!(permission_matches(&p, "tools", "execute", &no_context()));

        let action_wild = Permission::new("tools", "*");
        assert!(permission_matches(&action_wild, "tools", "execute", &no_context()));
        assert!(!permission_matches(&action_wild, "memory", "execute", &no_context()));
    }

    #[test]
    fn conditions_must_be_context_subset() {
        let p = Permission::new("tools", "execute").with_condition("category", "recon");

        let mut matching = BTreeMap::new();
        matching.insert("category".to_string(), "recon".to_string());
        matching.insert("extra".to_string(), "ignored".to_string());
        assert!(permission_matches(&p, "tools", "execute", &matching));

        let mut wrong = BTreeMap::new();
        wrong.insert("category".to_string(), "exploit".to_string());
        assert!(!permission_matches(&p, "tools", "execute", &wrong));

        assert!(
            !permission_matches(&p, "tools", "execute", &no_context()),
            "missing condition key must deny"
        );
    }

    #[test]
    fn any_permission_short_circuits() {
        let permissions = vec![
            Permission::new("memory", "read"),
            Permission::new("tools", "*"),
        ];
        assert!(any_permission_matches(&permissions, "tools", "execute", &no_context()));
        assert!(!any_permission_matches(&permissions, "auth", "admin", &no_context()));
    }
}
