//! Authorization layer: ordered allow/deny policy rules. Deny beats allow;
//! default deny once any rule exists and none matched.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::RequestContext;
use crate::errors::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Effect {
    Allow,
    Deny,
}

/// A single ordered policy rule. `resource` is matched against one of
/// `tool:<name>`, `server:<name>`, or `group:<name>` built from the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub effect: Effect,
    pub role: String,
    pub resource: String,
}

#[derive(Clone)]
pub struct AuthorizationLayer {
    rules: Arc<Vec<PolicyRule>>,
}

impl AuthorizationLayer {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules: Arc::new(rules) }
    }

    pub fn check(&self, ctx: &RequestContext) -> Result<(), RequestError> {
        let identity = ctx
            .identity
            .as_ref()
            .ok_or_else(|| RequestError::Forbidden("no identity attached to request".to_string()))?;

        let resources = [
            format!("tool:{}", ctx.capability_name),
            ctx.server_name
                .as_ref()
                .map(|s| format!("server:{s}"))
                .unwrap_or_default(),
        ];

        for rule in self.rules.iter() {
            let role_matches = identity.roles.iter().any(|r| r == &rule.role) || rule.role == "*";
            let resource_matches = resources.iter().any(|r| glob_matches(&rule.resource, r));
            if role_matches && resource_matches {
                return match rule.effect {
                    Effect::Allow => Ok(()),
                    Effect::Deny => Err(RequestError::Forbidden(format!(
                        "denied by policy rule for role '{}' on '{}'",
                        rule.role, rule.resource
                    ))),
                };
            }
        }

        if self.rules.is_empty() {
            Ok(())
        } else {
            Err(RequestError::Forbidden("no policy rule matched (default deny)".to_string()))
        }
    }
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    glob::Pattern::new(pattern).is_ok_and(|p| p.matches(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::McpMethod;

    fn ctx_with_roles(roles: Vec<String>, capability: &str) -> RequestContext {
        let mut ctx = RequestContext::new(McpMethod::CallTool, capability.to_string(), None, None);
        ctx.identity = Some(crate::middleware::UserIdentity {
            subject: "u".to_string(),
            email: None,
            name: None,
            roles,
            provider: "test",
            claims: serde_json::Value::Null,
        });
        ctx
    }

    #[test]
    fn empty_rules_allow_everything() {
        let layer = AuthorizationLayer::new(vec![]);
        let ctx = ctx_with_roles(vec![], "search");
        assert!(layer.check(&ctx).is_ok());
    }

    #[test]
    fn deny_rule_blocks_matching_role_and_resource() {
        let layer = AuthorizationLayer::new(vec![PolicyRule {
            effect: Effect::Deny,
            role: "guest".to_string(),
            resource: "tool:secret_*".to_string(),
        }]);
        let ctx = ctx_with_roles(vec!["guest".to_string()], "secret_delete");
        assert!(layer.check(&ctx).is_err());
    }

    #[test]
    fn default_deny_when_no_rule_matches() {
        let layer = AuthorizationLayer::new(vec![PolicyRule {
            effect: Effect::Allow,
            role: "admin".to_string(),
            resource: "tool:*".to_string(),
        }]);
        let ctx = ctx_with_roles(vec!["guest".to_string()], "search");
        assert!(layer.check(&ctx).is_err());
    }
}
