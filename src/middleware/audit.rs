//! Audit layer: records request start/outcome as a structured event and
//! tracks per-method latency percentiles.

use std::sync::Mutex;
use std::collections::HashMap;

use hdrhistogram::Histogram;
use serde_json::Value;
use tracing::info;

use super::RequestContext;
use crate::errors::RequestError;

pub struct AuditLayer {
    histograms: Mutex<HashMap<&'static str, Histogram<u64>>>,
}

impl AuditLayer {
    pub fn new() -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
        }
    }

    /// Emits the structured audit event and folds latency into the
    /// per-method histogram. Called once the inner chain has resolved.
    pub fn emit(&self, ctx: &RequestContext, result: &Result<Value, RequestError>) {
        let elapsed_ms = ctx.started_at.elapsed().as_millis() as u64;
        let method = ctx.mcp_method.as_str();

        if let Ok(mut histograms) = self.histograms.lock() {
            let histogram = histograms
                .entry(method)
                .or_insert_with(|| Histogram::new(3).expect("valid histogram sigfigs"));
            let _ = histogram.record(elapsed_ms.max(1));
        }

        match result {
            Ok(_) => info!(
                event_id = %ctx.id,
                method,
                capability = %ctx.capability_name,
                backend = ?ctx.server_name,
                original = ?ctx.original_name,
                outcome = "success",
                latency_ms = elapsed_ms,
                "request completed"
            ),
            Err(e) => info!(
                event_id = %ctx.id,
                method,
                capability = %ctx.capability_name,
                backend = ?ctx.server_name,
                original = ?ctx.original_name,
                outcome = "error",
                error = %e,
                error_type = e.code(),
                latency_ms = elapsed_ms,
                "request failed"
            ),
        }
    }

    /// p50/p95/p99 latency (ms) for a method, if any requests were recorded.
    pub fn percentiles(&self, method: &str) -> Option<(u64, u64, u64)> {
        let histograms = self.histograms.lock().ok()?;
        let h = histograms.get(method)?;
        Some((
            h.value_at_quantile(0.50),
            h.value_at_quantile(0.95),
            h.value_at_quantile(0.99),
        ))
    }
}

impl Default for AuditLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::McpMethod;

    #[test]
    fn records_latency_percentiles() {
        let audit = AuditLayer::new();
        for _ in 0..10 {
            let ctx = RequestContext::new(McpMethod::CallTool, "search".to_string(), None, None);
            audit.emit(&ctx, &Ok(Value::Null));
        }
        let (p50, p95, p99) = audit.percentiles("call_tool").unwrap();
        assert!(p50 <= p95 && p95 <= p99);
    }
}
