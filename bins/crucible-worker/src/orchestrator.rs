// Execution orchestration: one task = one sandbox for its whole
// duration. Stages the source once, then runs each test case in
// order, cleaning staged inputs between cases so sandbox disk use
// stays bounded within a task.

use crate::errors::{ExecError, SandboxError};
use crate::languages;
use crate::pool::{SandboxPool, SlotLease};
use crate::sandbox::SandboxRuntime;
use crate::sanitize::sanitize_output;
use crucible_common::types::{ExecutionResult, Task, TestCaseResult};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Orchestrator {
    pool: SandboxPool,
    runtime: SandboxRuntime,
}

impl Orchestrator {
    pub fn new(pool: SandboxPool, runtime: SandboxRuntime) -> Self {
        Self { pool, runtime }
    }

    /// Run a task's test cases, in order, inside one pooled sandbox.
    ///
    /// Per-test timeouts become failed results and never fault the
    /// task. Anything that prevents a result from being produced at
    /// all surfaces as `ExecError` and drives the caller's retry
    /// machinery.
    pub async fn run(&self, task: &Task) -> Result<ExecutionResult, ExecError> {
        // Reject unsupported languages before touching any sandbox.
        let interpreter = languages::interpreter(task.language)?;

        let lease = self.pool.allocate(task.language).await?;
        let outcome = self.run_in_slot(&lease, interpreter, task).await;
        self.pool.release(&lease).await;
        outcome
    }

    async fn run_in_slot(
        &self,
        lease: &SlotLease,
        interpreter: &str,
        task: &Task,
    ) -> Result<ExecutionResult, ExecError> {
        let source_file = languages::source_filename(task.language);
        self.runtime
            .stage_files(&lease.handle, &[(source_file.clone(), task.code.as_bytes())])
            .await
            .map_err(|e| ExecError::ExecutionFailed(e.into()))?;

        let timeout_ms = self.runtime.execution_timeout_ms();
        let mut results = Vec::with_capacity(task.test_cases.len());

        for case in &task.test_cases {
            let input_file = languages::input_filename();
            if let Err(e) = self
                .runtime
                .stage_files(&lease.handle, &[(input_file.clone(), case.input.as_bytes())])
                .await
            {
                self.cleanup_file(lease, &source_file).await;
                return Err(ExecError::ExecutionFailed(e.into()));
            }

            let cmd = languages::run_command(interpreter, &source_file, &input_file);
            let result = match self.runtime.exec(&lease.handle, cmd, timeout_ms).await {
                Ok(exec) => {
                    if exec.exit_code.is_some_and(|code| code != 0) {
                        debug!(
                            task_id = %task.task_id,
                            exit_code = exec.exit_code,
                            "test case exited non-zero"
                        );
                    }
                    let actual = sanitize_output(&exec.output);
                    TestCaseResult::from_execution(case, Some(actual), exec.elapsed_ms)
                }
                Err(e) if e.is_timeout() => {
                    warn!(task_id = %task.task_id, timeout_ms, "test case timed out");
                    TestCaseResult::from_execution(case, None, timeout_ms)
                }
                Err(e) => {
                    self.cleanup_file(lease, &input_file).await;
                    self.cleanup_file(lease, &source_file).await;
                    return Err(ExecError::ExecutionFailed(e.into()));
                }
            };

            results.push(result);
            self.cleanup_file(lease, &input_file).await;
        }

        self.cleanup_file(lease, &source_file).await;
        Ok(ExecutionResult::new(task.task_id.clone(), results))
    }

    /// Remove a staged file from the sandbox and the host scratch
    /// area. Best effort: a leftover file wastes a little disk until
    /// the sandbox is replaced, nothing more.
    async fn cleanup_file(&self, lease: &SlotLease, file_name: &str) {
        if let Err(e) = self.runtime.remove_file(&lease.handle, file_name).await {
            if !matches!(e, SandboxError::ExecutionTimeout { .. }) {
                warn!(file = %file_name, error = %e, "failed to remove staged file from sandbox");
            }
        }
        self.runtime.remove_scratch_file(file_name).await;
    }
}
