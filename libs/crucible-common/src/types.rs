use serde::{Deserialize, Serialize};
use std::fmt;

/// A task message pulled from the execution queue.
///
/// Produced by the intake API, immutable once enqueued. Unknown
/// languages fail deserialization, which routes the message to the
/// dead-letter queue rather than into a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub code: String,
    pub language: Language,
    pub test_cases: Vec<TestCaseSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Typescript,
    Python,
    Go,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Python => "python",
            Language::Go => "go",
        };
        f.write_str(name)
    }
}

/// One test case as submitted. `output` is the expected output; the
/// wire name is kept as-is so the intake API and this worker never
/// drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseSpec {
    pub input: String,
    pub output: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub problem_id: String,
    #[serde(default)]
    pub is_hidden: bool,
}

/// Outcome of running one test case inside a sandbox.
///
/// `actual_output` is `None` when the execution timed out and no
/// output was captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub input: String,
    pub output: String,
    pub description: String,
    pub actual_output: Option<String>,
    pub passed: bool,
    pub execution_time: u64,
}

impl TestCaseResult {
    /// Record an execution attempt against its spec. Both sides are
    /// trimmed and compared as plain strings, nothing smarter.
    pub fn from_execution(spec: &TestCaseSpec, actual: Option<String>, execution_time: u64) -> Self {
        let passed = actual
            .as_deref()
            .map_or(false, |a| a.trim() == spec.output.trim());
        Self {
            input: spec.input.clone(),
            output: spec.output.clone(),
            description: spec.description.clone(),
            actual_output: actual,
            passed,
            execution_time,
        }
    }
}

/// Aggregated result for one task attempt, written to the cache and
/// published to the results queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub results: Vec<TestCaseResult>,
    pub total_execution_time: u64,
}

impl ExecutionResult {
    /// `success` and `total_execution_time` are derived from the
    /// per-test results and never set independently.
    pub fn new(task_id: String, results: Vec<TestCaseResult>) -> Self {
        let success = results.iter().all(|r| r.passed);
        let total_execution_time = results.iter().map(|r| r.execution_time).sum();
        Self {
            task_id,
            success,
            results,
            total_execution_time,
        }
    }
}

/// Terminal failure record published when a task exhausts its retry
/// budget, so status polling observes a result instead of hanging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureResult {
    pub task_id: String,
    pub success: bool,
    pub error: String,
}

impl FailureResult {
    pub fn max_retries_exceeded(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            error: "Max retries exceeded".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(input: &str, output: &str) -> TestCaseSpec {
        TestCaseSpec {
            input: input.to_string(),
            output: output.to_string(),
            description: String::new(),
            id: String::new(),
            problem_id: String::new(),
            is_hidden: false,
        }
    }

    #[test]
    fn test_task_wire_format() {
        let body = r#"{
            "taskId": "abc123",
            "code": "print(input())",
            "language": "python",
            "testCases": [
                {"input": "hello", "output": "hello"},
                {"input": "5", "output": "25", "description": "square", "isHidden": true}
            ]
        }"#;

        let task: Task = serde_json::from_str(body).unwrap();
        assert_eq!(task.task_id, "abc123");
        assert_eq!(task.language, Language::Python);
        assert_eq!(task.test_cases.len(), 2);
        assert_eq!(task.test_cases[0].description, "");
        assert!(!task.test_cases[0].is_hidden);
        assert!(task.test_cases[1].is_hidden);
    }

    #[test]
    fn test_unknown_language_rejected() {
        let body = r#"{"taskId": "x", "code": "", "language": "cobol", "testCases": []}"#;
        assert!(serde_json::from_str::<Task>(body).is_err());
    }

    #[test]
    fn test_comparison_trims_both_sides() {
        // "4\n" against "4" passes, "4.0" against "4" does not
        let result = TestCaseResult::from_execution(&spec("2", "4"), Some("4\n".to_string()), 10);
        assert!(result.passed);

        let result = TestCaseResult::from_execution(&spec("2", "4"), Some("4.0".to_string()), 10);
        assert!(!result.passed);

        let result =
            TestCaseResult::from_execution(&spec("a", "  hi  "), Some("hi".to_string()), 10);
        assert!(result.passed);
    }

    #[test]
    fn test_timeout_carries_no_output() {
        let result = TestCaseResult::from_execution(&spec("x", ""), None, 15000);
        assert!(!result.passed);
        assert!(result.actual_output.is_none());
        assert_eq!(result.execution_time, 15000);
    }

    #[test]
    fn test_success_is_and_of_passed() {
        let cases = vec![
            TestCaseResult::from_execution(&spec("1", "1"), Some("1".to_string()), 5),
            TestCaseResult::from_execution(&spec("2", "2"), Some("2".to_string()), 7),
        ];
        let result = ExecutionResult::new("t1".to_string(), cases);
        assert!(result.success);
        assert_eq!(result.total_execution_time, 12);

        let cases = vec![
            TestCaseResult::from_execution(&spec("1", "1"), Some("1".to_string()), 5),
            TestCaseResult::from_execution(&spec("2", "2"), Some("wrong".to_string()), 7),
        ];
        let result = ExecutionResult::new("t2".to_string(), cases);
        assert!(!result.success);
    }

    #[test]
    fn test_result_wire_format() {
        let result = ExecutionResult::new(
            "t1".to_string(),
            vec![TestCaseResult::from_execution(
                &spec("in", "out"),
                None,
                100,
            )],
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["success"], false);
        assert_eq!(json["totalExecutionTime"], 100);
        assert!(json["results"][0]["actualOutput"].is_null());
        assert_eq!(json["results"][0]["executionTime"], 100);
    }

    #[test]
    fn test_failure_result_shape() {
        let json = serde_json::to_value(FailureResult::max_retries_exceeded("t9")).unwrap();
        assert_eq!(json["taskId"], "t9");
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Max retries exceeded");
    }
}
