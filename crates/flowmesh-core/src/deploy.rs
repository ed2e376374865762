//! Compiler / orchestrator boundary.
//!
//! The deployment manager never renders manifests or talks to a cluster
//! itself. A [`Compiler`] turns a process graph into a [`DeployableSpec`];
//! an [`Orchestrator`] applies or removes that spec on the target platform.

use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::BoxFuture;
use crate::config::OrchestratorConfig;
use crate::error::{CompileError, OrchestratorError};
use crate::process::{OrchestratorKind, ProcessGraph};

/// Everything an orchestrator needs to deploy (or tear down) one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployableSpec {
    pub deployment_id: String,
    pub kind: OrchestratorKind,
    pub namespace: String,
    /// Rendered manifests. Empty when the services are run out of band.
    pub manifests: String,
}

/// Turns a process graph into deployable specs.
pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        deployment_id: &str,
        graph: &ProcessGraph,
    ) -> Result<DeployableSpec, CompileError>;

    /// Spec exposing `deployment_id`'s entry point at a public `host`.
    fn compile_ingress(
        &self,
        deployment_id: &str,
        graph: &ProcessGraph,
        host: &str,
    ) -> Result<DeployableSpec, CompileError>;
}

/// Applies and removes deployable specs.
pub trait Orchestrator: Send + Sync {
    fn apply<'a>(&'a self, spec: &'a DeployableSpec) -> BoxFuture<'a, Result<(), OrchestratorError>>;

    fn remove<'a>(&'a self, spec: &'a DeployableSpec)
    -> BoxFuture<'a, Result<(), OrchestratorError>>;
}

// ── Compiler ───────────────────────────────────────────────────────

/// Compiler for graphs that ship their own manifests. Substitutes
/// `${DEPLOYMENT_ID}` and `${NAMESPACE}` and refuses any other placeholder.
#[derive(Debug, Default, Clone)]
pub struct PrerenderedCompiler;

impl PrerenderedCompiler {
    fn render(&self, template: &str, deployment_id: &str, namespace: &str) -> Result<String, CompileError> {
        let rendered = template
            .replace("${DEPLOYMENT_ID}", deployment_id)
            .replace("${NAMESPACE}", namespace);
        if let Some(at) = rendered.find("${") {
            let tail: String = rendered[at..].chars().take_while(|c| *c != '}').collect();
            return Err(CompileError::Template(format!("unresolved placeholder {tail}}}")));
        }
        Ok(rendered)
    }
}

fn namespace_for(deployment_id: &str, graph: &ProcessGraph) -> String {
    graph
        .properties
        .namespace
        .clone()
        .unwrap_or_else(|| deployment_id.to_string())
}

impl Compiler for PrerenderedCompiler {
    fn compile(
        &self,
        deployment_id: &str,
        graph: &ProcessGraph,
    ) -> Result<DeployableSpec, CompileError> {
        let namespace = namespace_for(deployment_id, graph);
        let manifests = match &graph.manifests {
            Some(template) => self.render(template, deployment_id, &namespace)?,
            None => String::new(),
        };
        Ok(DeployableSpec {
            deployment_id: deployment_id.to_string(),
            kind: graph.properties.orchestrator,
            namespace,
            manifests,
        })
    }

    fn compile_ingress(
        &self,
        deployment_id: &str,
        graph: &ProcessGraph,
        host: &str,
    ) -> Result<DeployableSpec, CompileError> {
        let entry = graph
            .resolve_entry(None)
            .map_err(|e| CompileError::Process(e.to_string()))?;
        let target = graph
            .callable_successors(entry)
            .next()
            .and_then(|v| v.service.as_ref())
            .ok_or_else(|| CompileError::Process("entry point has no service to expose".into()))?;
        let namespace = namespace_for(deployment_id, graph);
        let manifests = match graph.properties.orchestrator {
            OrchestratorKind::Docker => {
                return Err(CompileError::Process(
                    "ingress is not supported on docker".into(),
                ));
            }
            OrchestratorKind::Kubernetes => format!(
                "apiVersion: networking.k8s.io/v1\nkind: Ingress\nmetadata:\n  name: {deployment_id}\n  namespace: {namespace}\nspec:\n  rules:\n  - host: {host}\n    http:\n      paths:\n      - path: {path}\n        pathType: Prefix\n        backend:\n          service:\n            name: {service}\n            port:\n              number: {port}\n",
                path = target.path,
                service = target.host,
                port = target.port,
            ),
            OrchestratorKind::Istio => format!(
                "apiVersion: networking.istio.io/v1beta1\nkind: VirtualService\nmetadata:\n  name: {deployment_id}\n  namespace: {namespace}\nspec:\n  hosts:\n  - {host}\n  http:\n  - route:\n    - destination:\n        host: {service}\n        port:\n          number: {port}\n",
                service = target.host,
                port = target.port,
            ),
        };
        Ok(DeployableSpec {
            deployment_id: format!("{deployment_id}-ingress"),
            kind: graph.properties.orchestrator,
            namespace,
            manifests,
        })
    }
}

// ── Command orchestrator ───────────────────────────────────────────

/// Drives `kubectl` (kubernetes, istio) or `docker stack` (docker).
#[derive(Debug, Clone, Default)]
pub struct CommandOrchestrator {
    config: OrchestratorConfig,
}

impl CommandOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    fn apply_command(&self, spec: &DeployableSpec) -> (String, Vec<String>) {
        match spec.kind {
            OrchestratorKind::Docker => (
                self.config.docker.clone(),
                vec![
                    "stack".into(),
                    "deploy".into(),
                    "--compose-file".into(),
                    "-".into(),
                    spec.deployment_id.clone(),
                ],
            ),
            OrchestratorKind::Kubernetes | OrchestratorKind::Istio => (
                self.config.kubectl.clone(),
                vec!["apply".into(), "-f".into(), "-".into()],
            ),
        }
    }

    fn remove_command(&self, spec: &DeployableSpec) -> (String, Vec<String>) {
        match spec.kind {
            OrchestratorKind::Docker => (
                self.config.docker.clone(),
                vec!["stack".into(), "rm".into(), spec.deployment_id.clone()],
            ),
            OrchestratorKind::Kubernetes | OrchestratorKind::Istio => (
                self.config.kubectl.clone(),
                vec![
                    "delete".into(),
                    "--ignore-not-found".into(),
                    "-f".into(),
                    "-".into(),
                ],
            ),
        }
    }

    async fn run(
        program: String,
        args: Vec<String>,
        stdin: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let command = format!("{program} {}", args.join(" "));
        debug!(%command, "running orchestrator command");
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OrchestratorError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| OrchestratorError::Spawn {
                    command: command.clone(),
                    reason: e.to_string(),
                })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| OrchestratorError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(OrchestratorError::Command {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Orchestrator for CommandOrchestrator {
    fn apply<'a>(&'a self, spec: &'a DeployableSpec) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move {
            if spec.manifests.is_empty() {
                debug!(deployment_id = %spec.deployment_id, "no manifests to apply");
                return Ok(());
            }
            let (program, args) = self.apply_command(spec);
            Self::run(program, args, Some(spec.manifests.as_str())).await?;
            info!(deployment_id = %spec.deployment_id, kind = spec.kind.as_str(), "applied");
            Ok(())
        })
    }

    fn remove<'a>(
        &'a self,
        spec: &'a DeployableSpec,
    ) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move {
            if spec.manifests.is_empty() {
                debug!(deployment_id = %spec.deployment_id, "no manifests to remove");
                return Ok(());
            }
            let (program, args) = self.remove_command(spec);
            let stdin = match spec.kind {
                OrchestratorKind::Docker => None,
                _ => Some(spec.manifests.as_str()),
            };
            Self::run(program, args, stdin).await?;
            info!(deployment_id = %spec.deployment_id, kind = spec.kind.as_str(), "removed");
            Ok(())
        })
    }
}

// ── Dry run ────────────────────────────────────────────────────────

/// Records specs instead of deploying them. Used by `flowd --orchestrator
/// dry-run` and by tests, which can make the next call fail.
#[derive(Debug, Default)]
pub struct DryRunOrchestrator {
    applied: Mutex<Vec<DeployableSpec>>,
    removed: Mutex<Vec<DeployableSpec>>,
    fail_apply: AtomicBool,
    fail_remove: AtomicBool,
}

impl DryRunOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<DeployableSpec> {
        self.applied
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn removed(&self) -> Vec<DeployableSpec> {
        self.removed
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Make the next `apply` fail.
    pub fn fail_next_apply(&self) {
        self.fail_apply.store(true, Ordering::SeqCst);
    }

    /// Make the next `remove` fail.
    pub fn fail_next_remove(&self) {
        self.fail_remove.store(true, Ordering::SeqCst);
    }

    fn record(
        slot: &Mutex<Vec<DeployableSpec>>,
        fail: &AtomicBool,
        spec: &DeployableSpec,
        action: &str,
    ) -> Result<(), OrchestratorError> {
        if fail.swap(false, Ordering::SeqCst) {
            return Err(OrchestratorError::Rejected(format!(
                "{action} of {} refused",
                spec.deployment_id
            )));
        }
        if let Ok(mut specs) = slot.lock() {
            specs.push(spec.clone());
        }
        info!(deployment_id = %spec.deployment_id, action, "dry run");
        Ok(())
    }
}

impl Orchestrator for DryRunOrchestrator {
    fn apply<'a>(&'a self, spec: &'a DeployableSpec) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move { Self::record(&self.applied, &self.fail_apply, spec, "apply") })
    }

    fn remove<'a>(
        &'a self,
        spec: &'a DeployableSpec,
    ) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move { Self::record(&self.removed, &self.fail_remove, spec, "remove") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tests::ORDER;

    fn graph() -> ProcessGraph {
        ProcessGraph::from_bytes(ORDER.as_bytes()).unwrap()
    }

    #[test]
    fn compile_substitutes_placeholders() {
        let mut graph = graph();
        graph.manifests = Some("name: ${DEPLOYMENT_ID}\nns: ${NAMESPACE}\n".into());
        let spec = PrerenderedCompiler.compile("order-1", &graph).unwrap();
        assert_eq!(spec.manifests, "name: order-1\nns: order-1\n");
        assert_eq!(spec.kind, OrchestratorKind::Docker);
    }

    #[test]
    fn compile_rejects_unknown_placeholder() {
        let mut graph = graph();
        graph.manifests = Some("image: ${IMAGE}".into());
        let err = PrerenderedCompiler.compile("order-1", &graph).unwrap_err();
        assert!(err.to_string().contains("${IMAGE}"));
    }

    #[test]
    fn compile_without_manifests_is_empty() {
        let spec = PrerenderedCompiler.compile("order-1", &graph()).unwrap();
        assert!(spec.manifests.is_empty());
    }

    #[test]
    fn ingress_targets_first_task() {
        let mut graph = graph();
        graph.properties.orchestrator = OrchestratorKind::Kubernetes;
        let spec = PrerenderedCompiler
            .compile_ingress("order-1", &graph, "orders.example.com")
            .unwrap();
        assert!(spec.manifests.contains("host: orders.example.com"));
        assert!(spec.manifests.contains("name: validate"));
        assert!(spec.manifests.contains("number: 5000"));

        graph.properties.orchestrator = OrchestratorKind::Docker;
        assert!(
            PrerenderedCompiler
                .compile_ingress("order-1", &graph, "orders.example.com")
                .is_err()
        );
    }

    #[tokio::test]
    async fn dry_run_records_and_fails_on_demand() {
        let orchestrator = DryRunOrchestrator::new();
        let spec = PrerenderedCompiler.compile("order-1", &graph()).unwrap();

        orchestrator.apply(&spec).await.unwrap();
        assert_eq!(orchestrator.applied(), vec![spec.clone()]);

        orchestrator.fail_next_remove();
        assert!(orchestrator.remove(&spec).await.is_err());
        orchestrator.remove(&spec).await.unwrap();
        assert_eq!(orchestrator.removed().len(), 1);
    }

    #[tokio::test]
    async fn command_orchestrator_skips_empty_manifests() {
        let orchestrator = CommandOrchestrator::new(OrchestratorConfig {
            kubectl: "/nonexistent/kubectl".into(),
            docker: "/nonexistent/docker".into(),
        });
        let spec = PrerenderedCompiler.compile("order-1", &graph()).unwrap();
        orchestrator.apply(&spec).await.unwrap();
    }

    #[tokio::test]
    async fn command_orchestrator_reports_spawn_failure() {
        let orchestrator = CommandOrchestrator::new(OrchestratorConfig {
            kubectl: "/nonexistent/kubectl".into(),
            docker: "/nonexistent/docker".into(),
        });
        let mut graph = graph();
        graph.manifests = Some("kind: Service".into());
        let spec = PrerenderedCompiler.compile("order-1", &graph).unwrap();
        let err = orchestrator.apply(&spec).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Spawn { .. }));
    }
}
