//! Tool dispatch router.
//!
//! Exclusive tools run one at a time on a single [`ExclusiveWorker`] task,
//! in the order their jobs were queued. Concurrent tools share a bounded
//! pool. Every attempt has a hard timeout, transient failures are retried
//! with capped exponential backoff, and every failure comes back as a
//! [`ToolResult`] instead of an `Err`.

use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc, oneshot};
use toolweave_config::DispatchConfig;
use toolweave_core::backoff::Backoff;
use toolweave_core::error::ToolError;
use toolweave_core::tool::{Affinity, RegisteredTool, Tool, ToolCall, ToolOutput, ToolRegistry, ToolResult};
use tracing::{debug, warn};

/// Dispatch tunables, resolved from `[dispatch]`.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub pool_size: usize,
    /// Per attempt
    pub timeout: Duration,
    pub backoff: Backoff,
    /// 0 disables truncation
    pub max_output_lines: usize,
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            pool_size: config.pool_size.max(1),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            backoff: Backoff::new(config.max_retries, config.base_delay_ms, config.max_delay_ms),
            max_output_lines: config.max_output_lines,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

// ── Exclusive worker ───────────────────────────────────────

struct ExclusiveJob {
    tool: Arc<dyn Tool>,
    arguments: Value,
    timeout: Duration,
    reply: oneshot::Sender<Result<ToolOutput, ToolError>>,
}

/// Handle to the task that serializes exclusive tools.
///
/// Create one per process and hand clones to every router so exclusive
/// tools never overlap, whichever session issued them.
#[derive(Clone)]
pub struct ExclusiveWorker {
    jobs: mpsc::UnboundedSender<ExclusiveJob>,
}

impl ExclusiveWorker {
    /// Start the worker on the current runtime.
    pub fn spawn() -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<ExclusiveJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = run_with_timeout(job.tool, job.arguments, job.timeout).await;
                // The caller may have been cancelled; the result is dropped then.
                let _ = job.reply.send(result);
            }
            debug!("Exclusive worker stopped");
        });
        Self { jobs }
    }

    async fn run(&self, tool: Arc<dyn Tool>, arguments: Value, timeout: Duration) -> Result<ToolOutput, ToolError> {
        let tool_name = tool.name().to_string();
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(ExclusiveJob {
                tool,
                arguments,
                timeout,
                reply,
            })
            .map_err(|_| ToolError::ExecutionFailed {
                tool_name: tool_name.clone(),
                reason: "exclusive worker is not running".into(),
            })?;
        rx.await.map_err(|_| ToolError::ExecutionFailed {
            tool_name,
            reason: "exclusive worker dropped the job".into(),
        })?
    }
}

/// Run one attempt on its own task so a panicking handler surfaces as an
/// error instead of taking the caller down. The task is aborted on timeout.
async fn run_with_timeout(tool: Arc<dyn Tool>, arguments: Value, limit: Duration) -> Result<ToolOutput, ToolError> {
    let tool_name = tool.name().to_string();
    let task = tokio::spawn(async move { tool.execute(arguments).await });
    let abort = task.abort_handle();
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => {
            let reason = if join_error.is_panic() {
                "tool panicked"
            } else {
                "tool task was aborted"
            };
            warn!(tool = %tool_name, reason, "Tool task failed");
            Err(ToolError::ExecutionFailed {
                tool_name,
                reason: reason.into(),
            })
        }
        Err(_) => {
            abort.abort();
            let timeout_ms = limit.as_millis() as u64;
            warn!(tool = %tool_name, timeout_ms, "Tool call timed out");
            Err(ToolError::Timeout { tool_name, timeout_ms })
        }
    }
}

// ── Router ─────────────────────────────────────────────────

/// A finished dispatch with its bookkeeping.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub result: ToolResult,
    /// Attempts made, including the first
    pub attempts: u32,
    pub elapsed: Duration,
}

impl Dispatched {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Executes tool calls against the capability table.
pub struct ToolDispatchRouter {
    registry: Arc<ToolRegistry>,
    exclusive: ExclusiveWorker,
    pool: Arc<Semaphore>,
    settings: DispatchSettings,
}

impl ToolDispatchRouter {
    /// Router with its own exclusive worker.
    pub fn new(registry: ToolRegistry, settings: DispatchSettings) -> Self {
        Self::with_worker(registry, ExclusiveWorker::spawn(), settings)
    }

    /// Router sharing an existing exclusive worker.
    pub fn with_worker(registry: ToolRegistry, exclusive: ExclusiveWorker, settings: DispatchSettings) -> Self {
        Self {
            registry: Arc::new(registry),
            exclusive,
            pool: Arc::new(Semaphore::new(settings.pool_size.max(1))),
            settings,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Execute one call. Never fails: errors become error results.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        self.execute(call).await.result
    }

    /// Execute calls concurrently; results come back in input order.
    pub async fn dispatch_all(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        self.execute_all(calls)
            .await
            .into_iter()
            .map(|d| d.result)
            .collect()
    }

    /// Like [`dispatch_all`](Self::dispatch_all), with attempt counts.
    pub async fn execute_all(&self, calls: &[ToolCall]) -> Vec<Dispatched> {
        join_all(calls.iter().map(|c| self.execute(c))).await
    }

    /// Like [`dispatch`](Self::dispatch), with attempt count and timing.
    pub async fn execute(&self, call: &ToolCall) -> Dispatched {
        let started = Instant::now();
        let finish = |result: ToolResult, attempts: u32| Dispatched {
            result,
            attempts,
            elapsed: started.elapsed(),
        };

        let Some(entry) = self.registry.get(&call.name) else {
            warn!(tool = %call.name, "Call to unknown tool");
            return finish(ToolResult::error(&call.id, &ToolError::NotFound(call.name.clone())), 0);
        };
        if let Err(e) = entry.check_arguments(&call.arguments) {
            debug!(tool = %call.name, error = %e, "Rejected tool arguments");
            return finish(ToolResult::error(&call.id, &e), 0);
        }

        let backoff = self.settings.backoff;
        let mut attempt = 1;
        loop {
            match self.attempt(entry, call.arguments.clone()).await {
                Ok(mut output) => {
                    output.content = truncate_lines(output.content, self.settings.max_output_lines);
                    debug!(tool = %call.name, attempt, "Tool call succeeded");
                    return finish(ToolResult::ok(&call.id, output), attempt);
                }
                Err(e) if e.is_transient() && attempt < backoff.attempts() => {
                    let delay = backoff.delay_for(attempt);
                    warn!(
                        tool = %call.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient tool failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(tool = %call.name, attempt, error = %e, "Tool call failed");
                    let mut result = ToolResult::error(&call.id, &e);
                    if attempt > 1 {
                        result.output.push_str(&format!(" (after {attempt} attempts)"));
                    }
                    return finish(result, attempt);
                }
            }
        }
    }

    async fn attempt(&self, entry: &RegisteredTool, arguments: Value) -> Result<ToolOutput, ToolError> {
        match entry.affinity {
            Affinity::Exclusive => {
                self.exclusive
                    .run(entry.handler.clone(), arguments, self.settings.timeout)
                    .await
            }
            Affinity::Concurrent => {
                let _permit = self.pool.acquire().await.map_err(|_| ToolError::ExecutionFailed {
                    tool_name: entry.name().to_string(),
                    reason: "worker pool is closed".into(),
                })?;
                run_with_timeout(entry.handler.clone(), arguments, self.settings.timeout).await
            }
        }
    }
}

/// Keep the first `max` lines and note how many were cut.
pub fn truncate_lines(content: String, max: usize) -> String {
    let total = content.lines().count();
    if max == 0 || total <= max {
        return content;
    }
    let mut kept = content.lines().take(max).collect::<Vec<_>>().join("\n");
    kept.push_str(&format!("\n... ({} more lines)", total - max));
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Sleeps for `ms` and records when it ran.
    struct Sleeper {
        name: &'static str,
        affinity: Affinity,
        spans: Arc<Mutex<Vec<(tokio::time::Instant, tokio::time::Instant)>>>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Sleeper {
        fn new(name: &'static str, affinity: Affinity) -> Self {
            Self {
                name,
                affinity,
                spans: Arc::default(),
                running: Arc::default(),
                peak: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Tool for Sleeper {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"ms": {"type": "integer"}}, "required": ["ms"]})
        }
        fn affinity(&self) -> Affinity {
            self.affinity
        }
        async fn execute(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let start = tokio::time::Instant::now();
            let ms = arguments["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            self.spans.lock().unwrap().push((start, tokio::time::Instant::now()));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ToolOutput::text(format!("slept {ms}")))
        }
    }

    /// Fails with `error` for the first `failures` calls.
    struct Flaky {
        failures: u32,
        error: fn() -> ToolError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails a few times"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _arguments: Value) -> Result<ToolOutput, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err((self.error)())
            } else {
                Ok(ToolOutput::text("ok"))
            }
        }
    }

    fn network() -> ToolError {
        ToolError::Network {
            tool_name: "flaky".into(),
            reason: "connection reset".into(),
        }
    }

    fn router(tools: Vec<Arc<dyn Tool>>, settings: DispatchSettings) -> ToolDispatchRouter {
        let mut registry = ToolRegistry::new();
        for t in tools {
            registry.register(t).unwrap();
        }
        ToolDispatchRouter::new(registry, settings)
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exclusive_calls_never_overlap() {
        let tool = Arc::new(Sleeper::new("scene", Affinity::Exclusive));
        let spans = tool.spans.clone();
        let r = router(vec![tool.clone() as Arc<dyn Tool>], DispatchSettings::default());

        let calls: Vec<_> = (0..4).map(|i| call(&format!("c{i}"), "scene", json!({"ms": 50}))).collect();
        let results = r.dispatch_all(&calls).await;
        assert!(results.iter().all(|r| r.success));
        assert_eq!(tool.peak.load(Ordering::SeqCst), 1);

        let mut spans = spans.lock().unwrap().clone();
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "exclusive spans overlap");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exclusive_calls_serialize_across_routers() {
        let tool = Arc::new(Sleeper::new("scene", Affinity::Exclusive));
        let worker = ExclusiveWorker::spawn();
        let build = || {
            let mut registry = ToolRegistry::new();
            registry.register(tool.clone()).unwrap();
            ToolDispatchRouter::with_worker(registry, worker.clone(), DispatchSettings::default())
        };
        let (a, b) = (build(), build());

        let ca = call("a", "scene", json!({"ms": 30}));
        let cb = call("b", "scene", json!({"ms": 30}));
        let (ra, rb) = tokio::join!(a.dispatch(&ca), b.dispatch(&cb));
        assert!(ra.success && rb.success);
        assert_eq!(tool.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_pool_is_bounded() {
        let tool = Arc::new(Sleeper::new("fetch", Affinity::Concurrent));
        let settings = DispatchSettings {
            pool_size: 4,
            ..Default::default()
        };
        let r = router(vec![tool.clone() as Arc<dyn Tool>], settings);

        let calls: Vec<_> = (0..8).map(|i| call(&format!("c{i}"), "fetch", json!({"ms": 100}))).collect();
        let started = tokio::time::Instant::now();
        r.dispatch_all(&calls).await;
        assert_eq!(tool.peak.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_input_order() {
        let tool = Arc::new(Sleeper::new("fetch", Affinity::Concurrent));
        let r = router(vec![tool as Arc<dyn Tool>], DispatchSettings::default());
        let calls = vec![
            call("slow", "fetch", json!({"ms": 300})),
            call("fast", "fetch", json!({"ms": 10})),
            call("mid", "fetch", json!({"ms": 100})),
        ];
        let ids: Vec<_> = r.dispatch_all(&calls).await.into_iter().map(|r| r.call_id).collect();
        assert_eq!(ids, vec!["slow", "fast", "mid"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_succeed() {
        let tool = Arc::new(Flaky {
            failures: 2,
            error: network,
            calls: AtomicU32::new(0),
        });
        let r = router(vec![tool.clone() as Arc<dyn Tool>], DispatchSettings::default());

        let started = tokio::time::Instant::now();
        let d = r.execute(&call("c1", "flaky", json!({}))).await;
        assert!(d.result.success);
        assert_eq!(d.attempts, 3);
        assert_eq!(d.retries(), 2);
        // 1s + 2s of backoff
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_error_payload() {
        let tool = Arc::new(Flaky {
            failures: u32::MAX,
            error: network,
            calls: AtomicU32::new(0),
        });
        let r = router(vec![tool.clone() as Arc<dyn Tool>], DispatchSettings::default());

        let started = tokio::time::Instant::now();
        let d = r.execute(&call("c1", "flaky", json!({}))).await;
        assert!(!d.result.success);
        assert_eq!(d.result.error_kind.as_deref(), Some("network"));
        assert!(d.result.output.contains("after 4 attempts"));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 4);
        // 1s + 2s + 4s
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let tool = Arc::new(Flaky {
            failures: u32::MAX,
            error: || ToolError::ExecutionFailed {
                tool_name: "flaky".into(),
                reason: "bad input".into(),
            },
            calls: AtomicU32::new(0),
        });
        let r = router(vec![tool.clone() as Arc<dyn Tool>], DispatchSettings::default());
        let d = r.execute(&call("c1", "flaky", json!({}))).await;
        assert_eq!(d.attempts, 1);
        assert_eq!(d.result.error_kind.as_deref(), Some("execution_failed"));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tools_time_out() {
        let tool = Arc::new(Sleeper::new("fetch", Affinity::Concurrent));
        let settings = DispatchSettings {
            timeout: Duration::from_secs(1),
            backoff: Backoff::none(),
            ..Default::default()
        };
        let r = router(vec![tool as Arc<dyn Tool>], settings);
        let result = r.dispatch(&call("c1", "fetch", json!({"ms": 10_000}))).await;
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("timeout"));
    }

    /// Panics on every call.
    struct Panicker {
        affinity: Affinity,
    }

    #[async_trait]
    impl Tool for Panicker {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "panics"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn affinity(&self) -> Affinity {
            self.affinity
        }
        async fn execute(&self, _arguments: Value) -> Result<ToolOutput, ToolError> {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn panicking_exclusive_tool_leaves_the_worker_running() {
        let scene = Arc::new(Sleeper::new("scene_get", Affinity::Exclusive));
        let r = router(
            vec![
                Arc::new(Panicker {
                    affinity: Affinity::Exclusive,
                }),
                scene as Arc<dyn Tool>,
            ],
            DispatchSettings::default(),
        );

        let boom = r.execute(&call("c1", "boom", json!({}))).await;
        assert!(!boom.result.success);
        assert_eq!(boom.result.error_kind.as_deref(), Some("execution_failed"));
        assert!(boom.result.output.contains("tool panicked"));
        assert_eq!(boom.attempts, 1);

        let next = r.dispatch(&call("c2", "scene_get", json!({"ms": 1}))).await;
        assert!(next.success, "{}", next.output);
        assert_eq!(next.output, "slept 1");
    }

    #[tokio::test]
    async fn panicking_concurrent_tool_becomes_an_error_result() {
        let r = router(
            vec![Arc::new(Panicker {
                affinity: Affinity::Concurrent,
            })],
            DispatchSettings::default(),
        );
        let result = r.dispatch(&call("c1", "boom", json!({}))).await;
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("execution_failed"));
    }

    #[tokio::test]
    async fn unknown_tools_and_bad_arguments_become_results() {
        let r = router(
            vec![Arc::new(Sleeper::new("fetch", Affinity::Concurrent))],
            DispatchSettings::default(),
        );
        let missing = r.dispatch(&call("c1", "ghost", json!({}))).await;
        assert_eq!(missing.error_kind.as_deref(), Some("not_found"));

        let bad = r.dispatch(&call("c2", "fetch", json!({"ms": "soon"}))).await;
        assert_eq!(bad.error_kind.as_deref(), Some("invalid_arguments"));
        assert_eq!(bad.call_id, "c2");
    }

    #[test]
    fn long_output_is_truncated_with_marker() {
        let text = (1..=10).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let cut = truncate_lines(text.clone(), 3);
        assert_eq!(cut, "line 1\nline 2\nline 3\n... (7 more lines)");
        assert_eq!(truncate_lines(text.clone(), 10), text);
        assert_eq!(truncate_lines(text.clone(), 0), text);
    }
}
