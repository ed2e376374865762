//! Exclusive gateway: one condition, two branches.
//!
//! The condition reads a value at a dotted path in the JSON body and
//! compares it against a literal. Only integers and strings compare; any
//! other value, a missing path or a body that is not JSON takes the false
//! branch.

use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value;
use tracing::{debug, warn};

use flowmesh_core::BoxFuture;
use flowmesh_core::config::{Comparand, ExclusiveConfig, parse_duration};
use flowmesh_core::headers;

use crate::error::{GatewayError, GatewayResult};
use crate::forward::{Forwarder, Outcome};
use crate::scaffold::RoutingStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Lt,
    Gt,
}

impl Operator {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "==" => Some(Self::Eq),
            "<" => Some(Self::Lt),
            ">" => Some(Self::Gt),
            _ => None,
        }
    }

    fn holds<T: PartialOrd>(self, left: T, right: T) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Lt => left < right,
            Self::Gt => left > right,
        }
    }
}

/// Value at `path` (`a.b.0.c`). Numeric segments index arrays.
pub fn lookup<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(body, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

pub fn evaluate(body: &Value, path: &str, operator: Operator, comparand: &Comparand) -> bool {
    match (lookup(body, path), comparand) {
        (Some(Value::Number(n)), Comparand::Int(right)) => {
            n.as_i64().is_some_and(|left| operator.holds(left, *right))
        }
        (Some(Value::String(left)), Comparand::Str(right)) => {
            operator.holds(left.as_str(), right.as_str())
        }
        _ => false,
    }
}

pub struct ExclusiveGateway {
    name: String,
    path: String,
    operator: Operator,
    comparand: Comparand,
    when_true: Forwarder,
    when_false: Forwarder,
}

impl ExclusiveGateway {
    pub fn from_config(config: &ExclusiveConfig, fail_url: Option<String>) -> GatewayResult<Self> {
        let operator = Operator::parse(&config.operator).ok_or_else(|| GatewayError::Config {
            name: config.name.clone(),
            reason: format!("unsupported operator {:?}", config.operator),
        })?;
        let timeout = parse_duration(&config.timeout).unwrap_or(Duration::from_secs(30));
        Ok(Self {
            name: config.name.clone(),
            path: config.path.clone(),
            operator,
            comparand: config.value.clone(),
            when_true: Forwarder::new(&config.true_url, config.true_attempts, timeout, fail_url.clone()),
            when_false: Forwarder::new(&config.false_url, config.false_attempts, timeout, fail_url),
        })
    }

    /// The branch `body` takes.
    pub fn choose(&self, body: &[u8]) -> &Forwarder {
        let taken = match serde_json::from_slice::<Value>(body) {
            Ok(value) => evaluate(&value, &self.path, self.operator, &self.comparand),
            Err(e) => {
                warn!(gateway = %self.name, error = %e, "body is not JSON; taking the false branch");
                false
            }
        };
        debug!(gateway = %self.name, path = %self.path, taken, "condition evaluated");
        if taken { &self.when_true } else { &self.when_false }
    }
}

impl RoutingStrategy for ExclusiveGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn route<'a>(&'a self, inbound: &'a HeaderMap, body: Bytes) -> BoxFuture<'a, GatewayResult<Outcome>> {
        Box::pin(async move {
            let branch = self.choose(&body);
            let mut outbound = headers::propagate(inbound);
            headers::set(&mut outbound, "content-type", "application/json");
            Ok(branch.forward(&outbound, body).await)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::scaffold::serve;
    use crate::test_support::Hop;
    use flowmesh_core::headers::{FLOW_ID, ORIGINAL_PATH, WF_ID};

    fn config(base: &str) -> ExclusiveConfig {
        ExclusiveConfig {
            name: "route".into(),
            port: 0,
            path: "val".into(),
            operator: ">".into(),
            value: Comparand::Int(100),
            true_url: format!("{base}/big"),
            false_url: format!("{base}/small"),
            true_attempts: 2,
            false_attempts: 1,
            fail_url: None,
            timeout: "2s".into(),
        }
    }

    #[test]
    fn numbers_compare_numerically() {
        let gt = Comparand::Int(100);
        assert!(evaluate(&json!({"val": 137}), "val", Operator::Gt, &gt));
        assert!(!evaluate(&json!({"val": 1}), "val", Operator::Gt, &gt));
        assert!(evaluate(&json!({"val": 1}), "val", Operator::Lt, &gt));
        assert!(evaluate(&json!({"val": 100}), "val", Operator::Eq, &gt));
    }

    #[test]
    fn strings_and_nested_paths() {
        let body = json!({"order": {"items": [{"sku": "A-1"}], "region": "eu"}});
        let eu = Comparand::Str("eu".into());
        assert!(evaluate(&body, "order.region", Operator::Eq, &eu));
        assert!(evaluate(&body, "order.items.0.sku", Operator::Eq, &Comparand::Str("A-1".into())));
        assert!(evaluate(&body, "order.region", Operator::Lt, &Comparand::Str("us".into())));
    }

    #[test]
    fn non_scalars_and_mismatches_are_false() {
        let body = json!({"val": [1, 2], "obj": {"a": 1}, "f": 1.5, "s": "137"});
        for op in [Operator::Eq, Operator::Lt, Operator::Gt] {
            assert!(!evaluate(&body, "val", op, &Comparand::Int(100)));
            assert!(!evaluate(&body, "obj", op, &Comparand::Int(100)));
            assert!(!evaluate(&body, "f", op, &Comparand::Int(100)));
            assert!(!evaluate(&body, "s", op, &Comparand::Int(100)));
            assert!(!evaluate(&body, "missing", op, &Comparand::Int(100)));
        }
    }

    #[test]
    fn unknown_operator_is_a_config_error() {
        let mut bad = ExclusiveConfig {
            operator: ">=".into(),
            ..config("http://127.0.0.1:1")
        };
        assert!(ExclusiveGateway::from_config(&bad, None).is_err());
        bad.operator = "==".into();
        assert!(ExclusiveGateway::from_config(&bad, None).is_ok());
    }

    #[tokio::test]
    async fn routes_each_branch_over_http() {
        let hop = Hop::start().await;
        let gateway = Arc::new(ExclusiveGateway::from_config(&config(&hop.url("")), None).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(serve(listener, gateway, stop_rx));

        let mut ids = HeaderMap::new();
        headers::set(&mut ids, FLOW_ID, "shop-1-i");
        headers::set(&mut ids, WF_ID, "shop-1");
        ids.insert("x-b3-traceid", "t-1".parse().unwrap());

        let url = format!("http://{addr}/");
        let timeout = Duration::from_secs(2);
        flowmesh_core::http::post(&url, &ids, Bytes::from_static(br#"{"val": 137}"#), timeout)
            .await
            .unwrap();
        flowmesh_core::http::post(&url, &ids, Bytes::from_static(br#"{"val": 1}"#), timeout)
            .await
            .unwrap();

        let big = hop.received("/big");
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].body, r#"{"val": 137}"#);
        assert_eq!(big[0].header(FLOW_ID), Some("shop-1-i"));
        assert_eq!(big[0].header("x-b3-traceid"), Some("t-1"));
        assert_eq!(hop.hits("/small"), 1);
    }

    #[tokio::test]
    async fn branch_budgets_are_independent() {
        let hop = Hop::start().await;
        hop.fail("/big");
        hop.fail("/small");
        let mut cfg = config(&hop.url(""));
        cfg.fail_url = Some(hop.url("/instancefail"));
        let gateway = ExclusiveGateway::from_config(&cfg, cfg.fail_url.clone()).unwrap();

        let mut ids = HeaderMap::new();
        headers::set(&mut ids, FLOW_ID, "shop-1-i");
        headers::set(&mut ids, WF_ID, "shop-1");

        let outcome = gateway.route(&ids, Bytes::from_static(br#"{"val": 137}"#)).await.unwrap();
        assert!(matches!(outcome, Outcome::Reported(_)));
        assert_eq!(hop.hits("/big"), 2);

        gateway.route(&ids, Bytes::from_static(br#"{"val": 1}"#)).await.unwrap();
        assert_eq!(hop.hits("/small"), 1);

        let reports = hop.received("/instancefail");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].header(ORIGINAL_PATH), Some("/big"));
        assert_eq!(reports[1].header(ORIGINAL_PATH), Some("/small"));
    }

    #[tokio::test]
    async fn calls_without_ids_are_rejected() {
        let hop = Hop::start().await;
        let gateway = Arc::new(ExclusiveGateway::from_config(&config(&hop.url("")), None).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(serve(listener, gateway, stop_rx));

        let err = flowmesh_core::http::post(
            &format!("http://{addr}/"),
            &HeaderMap::new(),
            Bytes::from_static(b"{}"),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("400"));
        assert_eq!(hop.hits("/big") + hop.hits("/small"), 0);
    }
}
