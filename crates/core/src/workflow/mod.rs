//! C10 — Workflow Engine. DAG executor with dependency resolution, bounded
//! concurrency, retry, per-step/overall timeouts, and cooperative
//! cancellation. Execution fans out concurrently by dependency readiness
//! rather than running steps strictly in order, with a per-step
//! `skip`/`fail_workflow`/`retry` failure policy instead of saga-style
//! compensation.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{ExecutionId, OnFailure, Step, StepId, StepResult, StepStatus, Workflow};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow invalid: {0}")]
    Invalid(String),
    #[error("execution not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecutionStatus {
    pub overall_status: OverallStatus,
    pub steps: HashMap<StepId, StepResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionHandle(pub ExecutionId);

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn invoke(&self, tool_name: &str, args: serde_json::Value, cancel: CancellationToken) -> Result<serde_json::Value, String>;
    fn exists(&self, tool_name: &str) -> bool;
    fn is_idempotent(&self, tool_name: &str) -> bool;
}

/// A cheaply-clonable cooperative cancellation signal: an atomic flag
/// paired with a `Notify` so waiters don't need to poll it.
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)), notify: Arc::new(tokio::sync::Notify::new()) }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_workflow(workflow: &Workflow, executor: &dyn ToolExecutor) -> Result<(), WorkflowError> {
    let mut seen: BTreeSet<StepId> = BTreeSet::new();
    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !seen.contains(dep) {
                return Err(WorkflowError::Invalid(format!(
                    "step {:?} depends on {:?} which is not declared earlier",
                    step.id, dep
                )));
            }
        }
        if !executor.exists(&step.tool_name) {
            return Err(WorkflowError::Invalid(format!("unknown tool {}", step.tool_name)));
        }
        seen.insert(step.id);
    }
    detect_cycle(workflow)
}

fn detect_cycle(workflow: &Workflow) -> Result<(), WorkflowError> {
    let mut indegree: HashMap<StepId, usize> = HashMap::new();
    let mut dependents: HashMap<StepId, Vec<StepId>> = HashMap::new();
    for step in &workflow.steps {
        indegree.entry(step.id).or_insert(0);
        for dep in &step.depends_on {
            *indegree.entry(step.id).or_insert(0) += 1;
            dependents.entry(*dep).or_default().push(step.id);
        }
    }
    let mut queue: VecDeque<StepId> = indegree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(children) = dependents.get(&id) {
            for child in children {
                let entry = indegree.get_mut(child).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }
    if visited != workflow.steps.len() {
        Err(WorkflowError::Invalid("cyclic dependency".into()))
    } else {
        Ok(())
    }
}

/// Resolves `{{step_id.field}}` placeholders in `args_template` against
/// completed ancestor outputs; a missing ancestor output substitutes
/// `null` (this is what lets a downstream step continue after an
/// ancestor was skipped rather than completed).
fn resolve_args(template: &serde_json::Value, outputs: &HashMap<StepId, Option<serde_json::Value>>) -> serde_json::Value {
    match template {
        serde_json::Value::String(s) => {
            if let Some(stripped) = s.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
                let key = stripped.trim();
                for (id, output) in outputs {
                    if key == id.0.to_string() || key.starts_with(&id.0.to_string()) {
                        return output.clone().unwrap_or(serde_json::Value::Null);
                    }
                }
                serde_json::Value::Null
            } else {
                template.clone()
            }
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_args(v, outputs));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(|v| resolve_args(v, outputs)).collect()),
        other => other.clone(),
    }
}

struct ExecutionState {
    workflow: Workflow,
    results: parking_lot::Mutex<HashMap<StepId, StepResult>>,
    overall: parking_lot::Mutex<OverallStatus>,
    cancel: CancellationToken,
}

enum Completion {
    Success { step_id: StepId, output: serde_json::Value, attempts: u32 },
    Failure { step_id: StepId, error: String, attempts: u32 },
    Cancelled { step_id: StepId, attempts: u32 },
}

pub struct WorkflowEngine {
    executor: Arc<dyn ToolExecutor>,
    cancel_grace: Duration,
    executions: DashMap<ExecutionId, Arc<ExecutionState>>,
}

impl WorkflowEngine {
    pub fn new(executor: Arc<dyn ToolExecutor>, cancel_grace: Duration) -> Self {
        Self { executor, cancel_grace, executions: DashMap::new() }
    }

    pub fn start(&self, workflow: Workflow, root_args: serde_json::Value, deadline: tokio::time::Instant) -> Result<ExecutionHandle, WorkflowError> {
        validate_workflow(&workflow, self.executor.as_ref())?;

        let mut results = HashMap::new();
        for step in &workflow.steps {
            results.insert(step.id, StepResult::pending(step.id));
        }

        let state = Arc::new(ExecutionState {
            workflow,
            results: parking_lot::Mutex::new(results),
            overall: parking_lot::Mutex::new(OverallStatus::Running),
            cancel: CancellationToken::new(),
        });

        let id = ExecutionId::new();
        self.executions.insert(id, state.clone());

        let executor = self.executor.clone();
        let cancel_grace = self.cancel_grace;
        tokio::spawn(run_workflow(state, executor, root_args, deadline, cancel_grace));

        Ok(ExecutionHandle(id))
    }

    pub fn status(&self, handle: ExecutionHandle) -> Result<ExecutionStatus, WorkflowError> {
        let state = self.executions.get(&handle.0).ok_or_else(|| WorkflowError::NotFound(handle.0.to_string()))?;
        let overall_status = *state.overall.lock();
        let steps = state.results.lock().clone();
        Ok(ExecutionStatus { overall_status, steps })
    }

    /// Idempotent: cancelling an already-terminal execution is a no-op.
    pub fn cancel(&self, handle: ExecutionHandle) -> Result<(), WorkflowError> {
        let state = self.executions.get(&handle.0).ok_or_else(|| WorkflowError::NotFound(handle.0.to_string()))?;
        state.cancel.cancel();
        Ok(())
    }
}

async fn run_workflow(
    state: Arc<ExecutionState>,
    executor: Arc<dyn ToolExecutor>,
    root_args: serde_json::Value,
    deadline: tokio::time::Instant,
    cancel_grace: Duration,
) {
    let max_concurrent = state.workflow.max_concurrent.max(1);
    let mut completed: BTreeSet<StepId> = BTreeSet::new();
    let mut skipped: BTreeSet<StepId> = BTreeSet::new();
    let mut running: BTreeSet<StepId> = BTreeSet::new();
    let mut outputs: HashMap<StepId, Option<serde_json::Value>> = HashMap::new();

    let (tx, mut rx) = mpsc::channel::<Completion>(32);

    loop {
        if state.cancel.is_cancelled() {
            finalize(&state, OverallStatus::Cancelled, &mut running, &mut rx, cancel_grace).await;
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            state.cancel.cancel();
            finalize(&state, OverallStatus::Failed, &mut running, &mut rx, cancel_grace).await;
            return;
        }

        let ready: Vec<StepId> = ready_steps(&state.workflow, &completed, &skipped, &running);
        let mut ready = ready;
        ready.sort();

        while running.len() < max_concurrent {
            let Some(step_id) = ready.first().copied() else { break };
            ready.remove(0);
            let step = state.workflow.steps.iter().find(|s| s.id == step_id).unwrap().clone();
            running.insert(step_id);

            {
                let mut results = state.results.lock();
                let r = results.get_mut(&step_id).unwrap();
                r.status = StepStatus::Running;
                r.attempts = 1;
                r.started_at = Some(Utc::now());
            }

            let args = if step.depends_on.is_empty() { root_args.clone() } else { resolve_args(&step.args_template, &outputs) };
            let tx = tx.clone();
            let executor = executor.clone();
            let cancel = state.cancel.clone();
            let step_timeout = step.timeout;
            let on_failure = step.on_failure;
            let max_retries = step.max_retries;
            let tool_name = step.tool_name.clone();

            // Retries (including backoff) run inside this task so the
            // driver loop keeps dispatching other ready steps and stays
            // responsive to cancellation/deadline the whole time.
            tokio::spawn(async move {
                let idempotent = executor.is_idempotent(&tool_name);
                let mut attempt: u32 = 1;
                loop {
                    let call_cancel = cancel.clone();
                    let invoked = tokio::select! {
                        res = tokio::time::timeout(step_timeout, executor.invoke(&tool_name, args.clone(), call_cancel)) => res,
                        _ = cancel.cancelled() => {
                            let _ = tx.send(Completion::Cancelled { step_id, attempts: attempt }).await;
                            return;
                        }
                    };
                    let error = match invoked {
                        Ok(Ok(output)) => {
                            let _ = tx.send(Completion::Success { step_id, output, attempts: attempt }).await;
                            return;
                        }
                        Ok(Err(e)) => e,
                        Err(_elapsed) => "step timed out".to_string(),
                    };

                    let can_retry = on_failure == OnFailure::Retry && idempotent && attempt <= max_retries;
                    if can_retry {
                        let backoff = Duration::from_millis(100) * 2u32.pow(attempt.min(10));
                        attempt += 1;
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {},
                            _ = cancel.cancelled() => {
                                let _ = tx.send(Completion::Cancelled { step_id, attempts: attempt }).await;
                                return;
                            }
                        }
                        continue;
                    }

                    let _ = tx.send(Completion::Failure { step_id, error, attempts: attempt }).await;
                    return;
                }
            });
        }

        if running.is_empty() && ready_steps(&state.workflow, &completed, &skipped, &running).is_empty() {
            break;
        }

        let recv = tokio::time::timeout_at(deadline, rx.recv()).await;
        let completion = match recv {
            Ok(Some(c)) => c,
            Ok(None) => break,
            Err(_) => {
                state.cancel.cancel();
                finalize(&state, OverallStatus::Failed, &mut running, &mut rx, cancel_grace).await;
                return;
            }
        };

        match completion {
            Completion::Success { step_id, output, attempts } => {
                running.remove(&step_id);
                completed.insert(step_id);
                outputs.insert(step_id, Some(output.clone()));
                let mut results = state.results.lock();
                let r = results.get_mut(&step_id).unwrap();
                r.status = StepStatus::Completed;
                r.attempts = attempts;
                r.ended_at = Some(Utc::now());
                r.output = Some(output);
            }
            Completion::Cancelled { step_id, attempts } => {
                running.remove(&step_id);
                let mut results = state.results.lock();
                let r = results.get_mut(&step_id).unwrap();
                r.status = StepStatus::Cancelled;
                r.attempts = attempts;
                r.ended_at = Some(Utc::now());
            }
            Completion::Failure { step_id, error, attempts } => {
                running.remove(&step_id);
                let step = state.workflow.steps.iter().find(|s| s.id == step_id).unwrap().clone();

                // A step only reaches here once its task has exhausted
                // any retries itself, so `OnFailure::Retry` at this point
                // means retries ran out — treat it as a failure, not as
                // `Skip`, so it can't be confused with an intentional skip.
                match step.on_failure {
                    OnFailure::Skip => {
                        skipped.insert(step_id);
                        outputs.insert(step_id, None);
                        let mut results = state.results.lock();
                        let r = results.get_mut(&step_id).unwrap();
                        r.status = StepStatus::Skipped;
                        r.attempts = attempts;
                        r.ended_at = Some(Utc::now());
                        r.error = Some(error);
                    }
                    OnFailure::FailWorkflow | OnFailure::Retry => {
                        {
                            let mut results = state.results.lock();
                            let r = results.get_mut(&step_id).unwrap();
                            r.status = StepStatus::Failed;
                            r.attempts = attempts;
                            r.ended_at = Some(Utc::now());
                            r.error = Some(error);
                        }
                        state.cancel.cancel();
                        finalize(&state, OverallStatus::Failed, &mut running, &mut rx, cancel_grace).await;
                        return;
                    }
                }
            }
        }
    }

    *state.overall.lock() = OverallStatus::Completed;
}

fn ready_steps(workflow: &Workflow, completed: &BTreeSet<StepId>, skipped: &BTreeSet<StepId>, running: &BTreeSet<StepId>) -> Vec<StepId> {
    let done: BTreeSet<StepId> = completed.union(skipped).copied().collect();
    workflow
        .steps
        .iter()
        .filter(|s| !done.contains(&s.id) && !running.contains(&s.id))
        .filter(|s| s.depends_on.iter().all(|d| done.contains(d)))
        .map(|s| s.id)
        .collect()
}

async fn finalize(
    state: &Arc<ExecutionState>,
    status: OverallStatus,
    running: &mut BTreeSet<StepId>,
    rx: &mut mpsc::Receiver<Completion>,
    cancel_grace: Duration,
) {
    let deadline = tokio::time::Instant::now() + cancel_grace;
    while !running.is_empty() {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(Completion::Success { step_id, .. }))
            | Ok(Some(Completion::Failure { step_id, .. }))
            | Ok(Some(Completion::Cancelled { step_id, .. })) => {
                running.remove(&step_id);
            }
            _ => break,
        }
    }
    let mut results = state.results.lock();
    for (_, r) in results.iter_mut() {
        if r.status == StepStatus::Running {
            r.status = StepStatus::Cancelled;
            r.ended_at = Some(Utc::now());
        }
    }
    *state.overall.lock() = status;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoExecutor {
        known: Vec<String>,
        fail: Vec<String>,
    }

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn invoke(&self, tool_name: &str, args: serde_json::Value, _cancel: CancellationToken) -> Result<serde_json::Value, String> {
            if self.fail.contains(&tool_name.to_string()) {
                return Err("boom".to_string());
            }
            Ok(json!({"tool": tool_name, "args": args}))
        }
        fn exists(&self, tool_name: &str) -> bool {
            self.known.contains(&tool_name.to_string())
        }
        fn is_idempotent(&self, _tool_name: &str) -> bool {
            true
        }
    }

    fn step(id: u32, tool: &str, deps: &[u32], on_failure: OnFailure) -> Step {
        Step {
            id: StepId(uuid::Uuid::from_u128(id as u128)),
            tool_name: tool.to_string(),
            args_template: json!({}),
            depends_on: deps.iter().map(|d| StepId(uuid::Uuid::from_u128(*d as u128))).collect(),
            on_failure,
            max_retries: 1,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn executes_linear_workflow_in_order() {
        let executor = Arc::new(EchoExecutor { known: vec!["a".into(), "b".into(), "c".into()], fail: vec![] });
        let engine = WorkflowEngine::new(executor, Duration::from_millis(50));
        let workflow = Workflow {
            name: "diagnose".into(),
            max_concurrent: 2,
            steps: vec![step(1, "a", &[], OnFailure::FailWorkflow), step(2, "b", &[1], OnFailure::FailWorkflow), step(3, "c", &[2], OnFailure::FailWorkflow)],
        };
        let handle = engine.start(workflow, json!({}), tokio::time::Instant::now() + Duration::from_secs(5)).unwrap();

        let status = wait_terminal(&engine, handle).await;
        assert_eq!(status.overall_status, OverallStatus::Completed);
    }

    #[tokio::test]
    async fn skip_on_failure_continues_workflow() {
        let executor = Arc::new(EchoExecutor { known: vec!["a".into(), "b".into(), "c".into()], fail: vec!["b".into()] });
        let engine = WorkflowEngine::new(executor, Duration::from_millis(50));
        let workflow = Workflow {
            name: "diagnose".into(),
            max_concurrent: 2,
            steps: vec![step(1, "a", &[], OnFailure::FailWorkflow), step(2, "b", &[1], OnFailure::Skip), step(3, "c", &[2], OnFailure::FailWorkflow)],
        };
        let handle = engine.start(workflow, json!({}), tokio::time::Instant::now() + Duration::from_secs(5)).unwrap();
        let status = wait_terminal(&engine, handle).await;
        assert_eq!(status.overall_status, OverallStatus::Completed);
        let step2 = StepId(uuid::Uuid::from_u128(2));
        assert_eq!(status.steps[&step2].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn retry_exhausted_marks_step_failed_not_skipped() {
        let executor = Arc::new(EchoExecutor { known: vec!["a".into()], fail: vec!["a".into()] });
        let engine = WorkflowEngine::new(executor, Duration::from_millis(50));
        let mut retry_step = step(1, "a", &[], OnFailure::Retry);
        retry_step.max_retries = 2;
        let workflow = Workflow { name: "flaky".into(), max_concurrent: 1, steps: vec![retry_step] };
        let handle = engine.start(workflow, json!({}), tokio::time::Instant::now() + Duration::from_secs(5)).unwrap();

        let status = wait_terminal(&engine, handle).await;
        assert_eq!(status.overall_status, OverallStatus::Failed);
        let step1 = StepId(uuid::Uuid::from_u128(1));
        assert_eq!(status.steps[&step1].status, StepStatus::Failed);
        assert!(status.steps[&step1].attempts >= 2);
    }

    #[tokio::test]
    async fn cyclic_dependency_is_invalid() {
        let executor = Arc::new(EchoExecutor { known: vec!["a".into(), "b".into()], fail: vec![] });
        let engine = WorkflowEngine::new(executor, Duration::from_millis(50));
        // step 2 claims to depend on step 1, but step 1's declared
        // dependency on 2 makes this a cycle at the detection stage.
        let mut s1 = step(1, "a", &[], OnFailure::FailWorkflow);
        s1.depends_on.insert(StepId(uuid::Uuid::from_u128(2)));
        let s2 = step(2, "b", &[1], OnFailure::FailWorkflow);
        let workflow = Workflow { name: "bad".into(), max_concurrent: 1, steps: vec![s2, s1] };
        let result = engine.start(workflow, json!({}), tokio::time::Instant::now() + Duration::from_secs(5));
        assert!(result.is_err());
    }

    async fn wait_terminal(engine: &WorkflowEngine, handle: ExecutionHandle) -> ExecutionStatus {
        for _ in 0..200 {
            let status = engine.status(handle).unwrap();
            if status.overall_status != OverallStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow did not terminate in time");
    }
}
