//! Operation runners and the class registry.
//!
//! A phase declares operations by class name; the registry maps each class
//! to a runner implementation. Definitions are resolved against the
//! registry before execution starts, so an unknown class fails the run
//! up front instead of mid-flight.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::{PhaseId, WorkflowDefinition};
use crate::error::{Error, Result};
use crate::rlog_debug;

/// Everything a runner gets for a single operation invocation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Phase the operation belongs to.
    pub phase_id: PhaseId,
    /// Operation class name, as declared in the definition.
    pub class: String,
    /// Static parameters from the definition.
    pub params: Value,
    /// Payloads of the phase's direct dependencies, keyed by phase id.
    pub inputs: HashMap<PhaseId, Value>,
    /// Cooperative cancellation signal for the whole run.
    pub cancel: CancellationToken,
}

/// An executable operation class.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    /// Execute one operation and return its payload.
    async fn run(&self, ctx: OperationContext) -> Result<Value>;
}

/// Optional degraded-mode payload for a class whose breaker is open.
pub trait FallbackProvider: Send + Sync {
    /// Payload to substitute when the class's circuit is open, or `None`
    /// to let the rejection surface as a phase failure.
    fn fallback(&self, ctx: &OperationContext) -> Option<Value>;
}

struct RegistryEntry {
    runner: Arc<dyn OperationRunner>,
    fallback: Option<Arc<dyn FallbackProvider>>,
}

/// Maps operation class names to runners.
#[derive(Default)]
pub struct OperationRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner for a class, replacing any previous registration.
    pub fn register(&mut self, class: impl Into<String>, runner: Arc<dyn OperationRunner>) {
        self.entries.insert(
            class.into(),
            RegistryEntry {
                runner,
                fallback: None,
            },
        );
    }

    /// Register a runner together with a degraded-mode fallback.
    pub fn register_with_fallback(
        &mut self,
        class: impl Into<String>,
        runner: Arc<dyn OperationRunner>,
        fallback: Arc<dyn FallbackProvider>,
    ) {
        self.entries.insert(
            class.into(),
            RegistryEntry {
                runner,
                fallback: Some(fallback),
            },
        );
    }

    /// Runner for a class.
    pub fn resolve(&self, class: &str) -> Result<Arc<dyn OperationRunner>> {
        self.entries
            .get(class)
            .map(|e| Arc::clone(&e.runner))
            .ok_or_else(|| Error::UnknownOperationClass {
                class: class.to_string(),
            })
    }

    /// Fallback for a class, if one was registered.
    pub fn fallback_for(&self, class: &str) -> Option<Arc<dyn FallbackProvider>> {
        self.entries
            .get(class)
            .and_then(|e| e.fallback.as_ref().map(Arc::clone))
    }

    /// Verify every class the definition references is registered.
    pub fn validate_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        for phase in &definition.phases {
            for op in &phase.operations {
                if !self.entries.contains_key(&op.class) {
                    return Err(Error::UnknownOperationClass {
                        class: op.class.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn classes(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}

/// Runs a shell command, the built-in `shell` operation class.
///
/// Expects `params` of the form `{"command": "..."}`. Dependency payloads
/// are exported as `RELAY_INPUT_<PHASE>` environment variables holding
/// JSON. Stdout is parsed as JSON when possible, otherwise returned as a
/// plain string payload.
#[derive(Debug, Default)]
pub struct ShellRunner;

impl ShellRunner {
    fn env_key(phase_id: &PhaseId) -> String {
        let mangled: String = phase_id
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("RELAY_INPUT_{}", mangled)
    }
}

#[async_trait]
impl OperationRunner for ShellRunner {
    async fn run(&self, ctx: OperationContext) -> Result<Value> {
        let command = ctx
            .params
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "Phase '{}': shell operation requires a 'command' parameter",
                    ctx.phase_id
                ))
            })?;

        rlog_debug!("ShellRunner phase={} command={}", ctx.phase_id, command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("RELAY_PHASE", ctx.phase_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Cancellation drops the output future; the child must die
            // with it or it would keep running as an orphan.
            .kill_on_drop(true);
        for (phase_id, payload) in &ctx.inputs {
            cmd.env(Self::env_key(phase_id), payload.to_string());
        }

        let output = tokio::select! {
            output = cmd.output() => output?,
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Operation {
                class: ctx.class.clone(),
                message: format!(
                    "command exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => Ok(value),
            Err(_) => Ok(Value::String(trimmed.to_string())),
        }
    }
}
