//! Executor that runs external programs.
//!
//! Output policy: a line `HIVE_RESULT {json}` on stdout reports the outcome
//! (`{"status": "SUCCESS" | "FAILURE" | "BLOCKED", "notes": ..., "artifacts": [...]}`).
//! The last well-formed marker wins. Without one, exit status 0 is success
//! and anything else is a failure carrying the exit detail.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{
    Artifact, CommandSpec, HiveError, Outcome, OutcomeKind, TaskPayload, TaskRecord,
};
use crate::ports::TaskExecutor;

pub const RESULT_MARKER: &str = "HIVE_RESULT";

/// Captured output kept as artifacts, per stream.
const TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    marker: String,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self {
            marker: RESULT_MARKER.to_string(),
        }
    }

    pub fn with_marker(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    async fn run_command(
        &self,
        cmd: &CommandSpec,
        workdir: &Path,
        task: &TaskRecord,
    ) -> Result<Outcome, HiveError> {
        debug!(task_id = %task.id, program = %cmd.program, workdir = %workdir.display(), "spawning command");
        let child = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(&cmd.env)
            .env("HIVE_TASK_ID", task.id.to_string())
            .env("HIVE_WORKDIR", workdir)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let message = format!("failed to spawn '{}': {e}", cmd.program);
                if e.kind() == std::io::ErrorKind::NotFound {
                    HiveError::fatal_execution(message)
                } else {
                    HiveError::execution(message)
                }
            })?;

        // Dropping this future (deadline, cancel) kills the child.
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| HiveError::execution(format!("waiting for '{}': {e}", cmd.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(interpret_output(
            &self.marker,
            &stdout,
            &stderr,
            output.status.success(),
            &output.status.to_string(),
        ))
    }

    async fn run_pipeline(
        &self,
        steps: &[CommandSpec],
        max_parallel: usize,
        workdir: &Path,
        task: &TaskRecord,
    ) -> Result<Outcome, HiveError> {
        let step_futures: Vec<_> = steps
            .iter()
            .enumerate()
            .map(|(index, step)| async move {
                let step_dir = workdir.join(format!("step-{index}"));
                let result = match tokio::fs::create_dir_all(&step_dir).await {
                    Ok(()) => self.run_command(step, &step_dir, task).await,
                    Err(e) => Err(HiveError::from(e)),
                };
                (index, result)
            })
            .collect();
        let mut results: Vec<(usize, Result<Outcome, HiveError>)> =
            stream::iter(step_futures)
                .buffer_unordered(max_parallel.max(1))
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);
        combine_steps(steps, results)
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(
        &self,
        task: &TaskRecord,
        workdir: &Path,
        _deadline: Instant,
    ) -> Result<Outcome, HiveError> {
        match &task.payload {
            TaskPayload::Command(cmd) => self.run_command(cmd, workdir, task).await,
            TaskPayload::Pipeline {
                steps,
                max_parallel,
            } => self.run_pipeline(steps, *max_parallel, workdir, task).await,
            TaskPayload::Custom { executor, .. } => Err(HiveError::fatal_execution(format!(
                "command executor cannot run custom kind '{executor}'"
            ))),
        }
    }
}

/// Apply the marker policy to one finished process.
pub fn interpret_output(
    marker: &str,
    stdout: &str,
    stderr: &str,
    exited_ok: bool,
    exit_detail: &str,
) -> Outcome {
    let reported = stdout
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix(marker))
        .filter_map(|rest| serde_json::from_str::<Outcome>(rest.trim()).ok())
        .last();

    let outcome = match reported {
        Some(outcome) => outcome,
        None if exited_ok => Outcome::success("command exited successfully"),
        None => Outcome::failure(format!("command failed: {exit_detail}")),
    };

    let mut captured = Vec::new();
    if !stdout.trim().is_empty() {
        captured.push(Artifact::Stdout(tail(stdout).to_string()));
    }
    if !stderr.trim().is_empty() {
        captured.push(Artifact::Stderr(tail(stderr).to_string()));
    }
    outcome.with_artifacts(captured)
}

fn tail(text: &str) -> &str {
    if text.len() <= TAIL_BYTES {
        return text;
    }
    let mut start = text.len() - TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Any executor error fails the pipeline; otherwise BLOCKED beats FAILURE
/// beats SUCCESS.
fn combine_steps(
    steps: &[CommandSpec],
    results: Vec<(usize, Result<Outcome, HiveError>)>,
) -> Result<Outcome, HiveError> {
    let mut outcomes = Vec::with_capacity(results.len());
    for (index, result) in results {
        outcomes.push((index, result?));
    }

    let describe = |kind: OutcomeKind| -> Vec<String> {
        outcomes
            .iter()
            .filter(|(_, o)| o.kind == kind)
            .map(|(i, o)| {
                let program = steps.get(*i).map_or("?", |s| s.program.as_str());
                format!("step {i} ({program}): {}", o.notes)
            })
            .collect()
    };

    let blocked = describe(OutcomeKind::Blocked);
    let failed = describe(OutcomeKind::Failure);
    let artifacts: Vec<Artifact> = outcomes
        .iter()
        .flat_map(|(_, o)| o.artifacts.iter().cloned())
        .collect();

    let outcome = if !blocked.is_empty() {
        Outcome::blocked(blocked.join("; "))
    } else if !failed.is_empty() {
        Outcome::failure(failed.join("; "))
    } else {
        Outcome::success(format!("{} steps succeeded", outcomes.len()))
    };
    Ok(outcome.with_artifacts(artifacts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::no_marker_success("hello\n", true, OutcomeKind::Success)]
    #[case::no_marker_failure("hello\n", false, OutcomeKind::Failure)]
    #[case::marker_overrides_exit(
        "HIVE_RESULT {\"status\":\"SUCCESS\",\"notes\":\"fine\"}\n",
        false,
        OutcomeKind::Success
    )]
    #[case::last_marker_wins(
        "HIVE_RESULT {\"status\":\"FAILURE\"}\nHIVE_RESULT {\"status\":\"BLOCKED\",\"notes\":\"need input\"}\n",
        true,
        OutcomeKind::Blocked
    )]
    #[case::malformed_marker_ignored(
        "HIVE_RESULT {\"status\":\"FAILURE\"}\nHIVE_RESULT {not json\n",
        true,
        OutcomeKind::Failure
    )]
    fn marker_policy(#[case] stdout: &str, #[case] ok: bool, #[case] expected: OutcomeKind) {
        let outcome = interpret_output(RESULT_MARKER, stdout, "", ok, "exit status: 3");
        assert_eq!(outcome.kind, expected);
    }

    #[test]
    fn failure_without_marker_carries_exit_detail() {
        let outcome = interpret_output(RESULT_MARKER, "", "boom\n", false, "exit status: 3");
        assert_eq!(outcome.notes, "command failed: exit status: 3");
        assert_eq!(outcome.artifacts, vec![Artifact::Stderr("boom\n".into())]);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let text = "é".repeat(TAIL_BYTES);
        let kept = tail(&text);
        assert!(kept.len() <= TAIL_BYTES);
        assert!(kept.chars().all(|c| c == 'é'));
    }

    #[test]
    fn pipeline_blocked_beats_failure() {
        let steps = vec![CommandSpec::new("a"), CommandSpec::new("b"), CommandSpec::new("c")];
        let results = vec![
            (0, Ok(Outcome::success("ok"))),
            (1, Ok(Outcome::failure("bad"))),
            (2, Ok(Outcome::blocked("wait"))),
        ];
        let outcome = combine_steps(&steps, results).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Blocked);
        assert_eq!(outcome.notes, "step 2 (c): wait");
    }

    #[test]
    fn pipeline_error_fails_whole_run() {
        let steps = vec![CommandSpec::new("a"), CommandSpec::new("b")];
        let results = vec![
            (0, Ok(Outcome::success("ok"))),
            (1, Err(HiveError::execution("spawn failed"))),
        ];
        assert!(combine_steps(&steps, results).is_err());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::domain::{NewTask, TaskId};
        use chrono::Utc;
        use std::time::Duration;
        use ulid::Ulid;

        fn task(payload: TaskPayload) -> TaskRecord {
            TaskRecord::from_new(
                NewTask {
                    id: TaskId::from_ulid(Ulid::new()),
                    key: "t".into(),
                    title: "T".into(),
                    description: String::new(),
                    priority: 0,
                    dependencies: vec![],
                    timeout: Duration::from_secs(10),
                    max_attempts: 1,
                    payload,
                    created_at: Utc::now(),
                },
                0,
            )
        }

        fn sh(script: &str) -> CommandSpec {
            CommandSpec::new("sh").arg("-c").arg(script)
        }

        fn deadline() -> Instant {
            Instant::now() + Duration::from_secs(10)
        }

        #[tokio::test]
        async fn runs_in_workdir_and_reads_marker() {
            let dir = tempfile::tempdir().unwrap();
            let record = task(TaskPayload::Command(sh(
                "touch made-here; echo 'HIVE_RESULT {\"status\":\"SUCCESS\",\"notes\":\"built\"}'",
            )));
            let outcome = CommandExecutor::new()
                .execute(&record, dir.path(), deadline())
                .await
                .unwrap();
            assert_eq!(outcome.kind, OutcomeKind::Success);
            assert_eq!(outcome.notes, "built");
            assert!(dir.path().join("made-here").exists());
        }

        #[tokio::test]
        async fn non_zero_exit_is_failure() {
            let dir = tempfile::tempdir().unwrap();
            let record = task(TaskPayload::Command(sh("exit 3")));
            let outcome = CommandExecutor::new()
                .execute(&record, dir.path(), deadline())
                .await
                .unwrap();
            assert_eq!(outcome.kind, OutcomeKind::Failure);
        }

        #[tokio::test]
        async fn missing_program_is_not_retryable() {
            let dir = tempfile::tempdir().unwrap();
            let record = task(TaskPayload::Command(CommandSpec::new(
                "definitely-not-a-real-program-hive",
            )));
            let err = CommandExecutor::new()
                .execute(&record, dir.path(), deadline())
                .await
                .unwrap_err();
            assert!(!err.is_transient());
        }

        #[tokio::test]
        async fn pipeline_steps_get_their_own_directories() {
            let dir = tempfile::tempdir().unwrap();
            let record = task(TaskPayload::Pipeline {
                steps: vec![sh("touch out"), sh("touch out"), sh("touch out")],
                max_parallel: 2,
            });
            let outcome = CommandExecutor::new()
                .execute(&record, dir.path(), deadline())
                .await
                .unwrap();
            assert_eq!(outcome.kind, OutcomeKind::Success);
            for i in 0..3 {
                assert!(dir.path().join(format!("step-{i}")).join("out").exists());
            }
        }
    }
}
