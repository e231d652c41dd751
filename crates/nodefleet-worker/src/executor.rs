//! Task executor for running assigned tasks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use nodefleet_core::{ExecutionReply, Task, TaskPayload};

/// Output of one payload run: data on success, an error message otherwise
type Outcome = std::result::Result<Vec<u8>, String>;

/// Longest delay the `sleep` data function accepts
const MAX_SLEEP: Duration = Duration::from_secs(600);

/// Task executor
#[derive(Debug, Clone, Default)]
pub struct TaskExecutor {
    running: Arc<AtomicU32>,
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute a task and build the reply sent back to the orchestrator
    pub async fn execute(&self, task: &Task) -> ExecutionReply {
        info!(task_id = %task.id, task_name = %task.name, "Starting task execution");

        self.running.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let outcome = match &task.payload {
            TaskPayload::Command { command, args } => execute_command(command, args).await,
            TaskPayload::Compute { expression } => execute_compute(expression),
            TaskPayload::Data { function, data } => execute_data(function, data).await,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.running.fetch_sub(1, Ordering::Relaxed);

        info!(
            task_id = %task.id,
            success = outcome.is_ok(),
            duration_ms,
            "Task execution completed"
        );

        match outcome {
            Ok(data) => ExecutionReply::success(task.id, data, duration_ms),
            Err(error) => ExecutionReply::failure(task.id, error, duration_ms),
        }
    }

    /// Get current running task count
    pub fn running_count(&self) -> u32 {
        self.running.load(Ordering::Relaxed)
    }
}

/// Execute a command task
async fn execute_command(command: &str, args: &[String]) -> Outcome {
    info!(command = %command, args = ?args, "Executing command");

    #[cfg(target_family = "windows")]
    let result = tokio::process::Command::new("cmd")
        .arg("/C")
        .arg(command)
        .args(args)
        .output()
        .await;

    #[cfg(not(target_family = "windows"))]
    let result = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(format!("{} {}", command, args.join(" ")))
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => Ok(output.stdout),
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("command exited with {}: {}", output.status, stderr.trim_end()))
        }
        Err(e) => Err(format!("command execution failed: {}", e)),
    }
}

/// Execute a compute task
fn execute_compute(expression: &str) -> Outcome {
    debug!(expression = %expression, "Executing compute task");
    evaluate_simple_expression(expression).map(|value| value.to_string().into_bytes())
}

/// Evaluate `+ - * /` over decimal numbers, left-associative, with the
/// usual precedence. Runs in a single pass over the input.
fn evaluate_simple_expression(expr: &str) -> std::result::Result<f64, String> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err("empty expression".to_string());
    }

    if let Ok(n) = expr.parse::<f64>() {
        return Ok(n);
    }

    let invalid = || format!("cannot evaluate expression: {}", expr);
    let mut cursor = Cursor { rest: expr };
    let mut total = 0.0;
    let mut sign = 1.0;

    loop {
        // one term: operands joined by `*` and `/`
        let mut term = cursor.operand().ok_or_else(invalid)?;
        let next = loop {
            match cursor.operator() {
                Some('*') => term *= cursor.operand().ok_or_else(invalid)?,
                Some('/') => {
                    let divisor = cursor.operand().ok_or_else(invalid)?;
                    if divisor == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    term /= divisor;
                }
                other => break other,
            }
        };

        total += sign * term;
        match next {
            Some('+') => sign = 1.0,
            Some('-') => sign = -1.0,
            None if cursor.is_done() => return Ok(total),
            _ => return Err(invalid()),
        }
    }
}

/// Reads operands and operators off the front of an expression
struct Cursor<'a> {
    rest: &'a str,
}

impl Cursor<'_> {
    /// A number with any leading `+`/`-` signs
    fn operand(&mut self) -> Option<f64> {
        let mut sign = 1.0;
        loop {
            self.rest = self.rest.trim_start();
            match self.rest.chars().next()? {
                '+' => {}
                '-' => sign = -sign,
                _ => break,
            }
            self.rest = &self.rest[1..];
        }

        let len = self
            .rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(self.rest.len());
        let value = self.rest[..len].parse::<f64>().ok()?;
        self.rest = &self.rest[len..];
        Some(sign * value)
    }

    fn operator(&mut self) -> Option<char> {
        self.rest = self.rest.trim_start();
        let op = self
            .rest
            .chars()
            .next()
            .filter(|c| matches!(c, '+' | '-' | '*' | '/'))?;
        self.rest = &self.rest[1..];
        Some(op)
    }

    fn is_done(&self) -> bool {
        self.rest.trim().is_empty()
    }
}

/// Execute a data processing task
async fn execute_data(function: &str, data: &[u8]) -> Outcome {
    debug!(function = %function, data_len = data.len(), "Executing data task");

    let text = String::from_utf8_lossy(data);
    match function {
        "uppercase" => Ok(text.to_uppercase().into_bytes()),
        "lowercase" => Ok(text.to_lowercase().into_bytes()),
        "reverse" => Ok(text.chars().rev().collect::<String>().into_bytes()),
        "word_count" => Ok(text.split_whitespace().count().to_string().into_bytes()),
        "line_count" => Ok(text.lines().count().to_string().into_bytes()),
        "echo" => Ok(data.to_vec()),
        "hash" => {
            let hash = data
                .iter()
                .fold(0u64, |acc, &b| acc.wrapping_add(b as u64).wrapping_mul(31));
            Ok(format!("{:016x}", hash).into_bytes())
        }
        "sleep" => {
            let ms: u64 = text
                .trim()
                .parse()
                .map_err(|e| format!("sleep expects milliseconds: {}", e))?;
            let delay = Duration::from_millis(ms).min(MAX_SLEEP);
            tokio::time::sleep(delay).await;
            Ok(delay.as_millis().to_string().into_bytes())
        }
        "fail" => Err(text.into_owned()),
        _ => {
            warn!(function = %function, "Unknown data function");
            Err(format!("unknown function: {}", function))
        }
    }
}
