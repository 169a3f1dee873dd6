//! The HTTP surface: three proxy planes plus gateway introspection.
//!
//! Selection precedence within a plane is exact route, then declared
//! prefix, then the catch-all that consults the prefix table and rejects
//! unknown prefixes with 404.

pub mod frontend;
pub mod gateway;
pub mod system;
pub mod v1;

use crate::error::{GatewayError, Result};
use crate::proxy::ProxyEngine;
use crate::state::AppState;
use lattice_shared::LoadBalanceStrategy;
use axum::extract::Request;
use axum::response::Response;
use std::collections::HashMap;

/// Static prefix → backend-service table. Built once per plane; a
/// duplicate prefix is a configuration bug and panics at construction.
pub(crate) struct PrefixTable {
    map: HashMap<&'static str, &'static str>,
}

impl PrefixTable {
    pub(crate) fn new(entries: &[(&'static str, &'static str)]) -> Self {
        let mut map = HashMap::new();
        for (prefix, service) in entries {
            if map.insert(*prefix, *service).is_some() {
                panic!("duplicate route prefix: {}", prefix);
            }
        }
        Self { map }
    }

    pub(crate) fn service_for(&self, prefix: &str) -> Option<&'static str> {
        self.map.get(prefix).copied()
    }
}

/// First path segment, e.g. `/agents/execute` → `agents`.
pub(crate) fn first_segment(path: &str) -> Option<&str> {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .filter(|s| !s.is_empty())
}

/// Select a backend instance and forward the request, with connection
/// accounting around the upstream call.
pub(crate) async fn forward_to_service(
    state: &AppState,
    service: &str,
    strategy: LoadBalanceStrategy,
    target_path: String,
    request: Request,
) -> Result<Response> {
    let instance = state
        .registry
        .select(service, strategy)
        .await
        .ok_or_else(|| GatewayError::upstream_unavailable(service))?;

    let target_url = ProxyEngine::build_target_url(&instance.base_url(), &target_path);
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| GatewayError::bad_request(format!("unreadable request body: {}", e)))?;

    state
        .registry
        .acquire_connection(service, &instance.instance_id)
        .await;
    let result = state
        .proxy
        .forward(
            service,
            &parts.method,
            &target_url,
            &parts.headers,
            parts.uri.query(),
            body,
        )
        .await;
    state
        .registry
        .release_connection(service, &instance.instance_id)
        .await;

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_segment() {
        assert_eq!(first_segment("/agents/execute"), Some("agents"));
        assert_eq!(first_segment("agents"), Some("agents"));
        assert_eq!(first_segment("/"), None);
        assert_eq!(first_segment(""), None);
    }

    #[test]
    fn test_prefix_table_lookup() {
        let table = PrefixTable::new(&[("agents", "agent-service")]);
        assert_eq!(table.service_for("agents"), Some("agent-service"));
        assert_eq!(table.service_for("unknown"), None);
    }

    #[test]
    #[should_panic(expected = "duplicate route prefix")]
    fn test_duplicate_prefix_panics() {
        PrefixTable::new(&[("agents", "agent-service"), ("agents", "other-service")]);
    }
}
