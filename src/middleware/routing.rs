//! Routing layer: the terminal step of the chain. Resolves the capability
//! name to a backend, checks the circuit breaker, and dispatches.

use serde_json::Value;
use tracing::warn;

use super::{McpMethod, RequestContext};
use crate::backend::BackendManager;
use crate::circuit_breaker::CircuitState;
use crate::errors::RequestError;
use crate::session::SessionRecord;

pub async fn route(
    manager: &BackendManager,
    session: &SessionRecord,
    ctx: &mut RequestContext,
) -> Result<Value, RequestError> {
    let (backend_name, original_name) = resolve(session, ctx)?;
    ctx.server_name = Some(backend_name.clone());
    ctx.original_name = Some(original_name.clone());

    if manager.circuit_state(&backend_name) == Some(CircuitState::Open) {
        return Err(RequestError::BackendUnavailable(backend_name));
    }

    match ctx.mcp_method {
        McpMethod::CallTool => manager
            .call_tool(&backend_name, &original_name, ctx.arguments.clone())
            .await
            .map_err(|e| call_error(&backend_name, &original_name, e)),

        McpMethod::ReadResource => manager
            .read_resource(&backend_name, &original_name)
            .await
            .map_err(|e| call_error(&backend_name, &original_name, e)),

        McpMethod::GetPrompt => {
            let arguments = ctx.arguments.clone().map(|v| coerce_prompt_args(&original_name, v));
            manager
                .get_prompt(&backend_name, &original_name, arguments)
                .await
                .map_err(|e| call_error(&backend_name, &original_name, e))
        }
    }
}

/// Resolves against the requesting session's frozen route map, never the
/// live registry — a session's routing must not change under it even if
/// the registry has since been hot-reloaded.
fn resolve(session: &SessionRecord, ctx: &RequestContext) -> Result<(String, String), RequestError> {
    let map = match ctx.mcp_method {
        McpMethod::CallTool => &session.route_map.tools,
        McpMethod::ReadResource => &session.route_map.resources,
        McpMethod::GetPrompt => &session.route_map.prompts,
    };
    map.get(&ctx.capability_name)
        .cloned()
        .ok_or_else(|| RequestError::CapabilityNotFound(ctx.capability_name.clone()))
}

fn call_error(backend: &str, capability: &str, e: anyhow::Error) -> RequestError {
    RequestError::BackendCall {
        backend: backend.to_string(),
        reason: format!("{capability}: {e}"),
    }
}

/// Best-effort coerce every prompt argument value to its string form.
/// Values that fail to stringify keep their original value and log a warning
/// naming the key — forwarded as-is rather than dropped.
fn coerce_prompt_args(prompt_name: &str, value: Value) -> Value {
    let Value::Object(map) = value else {
        return value;
    };

    let coerced = map
        .into_iter()
        .map(|(key, v)| {
            let stringified = match &v {
                Value::String(_) => v.clone(),
                Value::Null => {
                    warn!(prompt = %prompt_name, arg = %key, "prompt argument is null, keeping original value");
                    v.clone()
                }
                other => match serde_json::to_string(other) {
                    Ok(s) => Value::String(s),
                    Err(_) => {
                        warn!(prompt = %prompt_name, arg = %key, "failed to stringify prompt argument, keeping original value");
                        v.clone()
                    }
                },
            };
            (key, stringified)
        })
        .collect();

    Value::Object(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_prompt_args_stringifies_scalars() {
        let input = serde_json::json!({"count": 3, "name": "x", "tags": ["a", "b"]});
        let out = coerce_prompt_args("demo", input);
        assert_eq!(out["count"], Value::String("3".to_string()));
        assert_eq!(out["name"], Value::String("x".to_string()));
        assert_eq!(out["tags"], Value::String("[\"a\",\"b\"]".to_string()));
    }
}
