use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use quill_agent_pool::spawn_with_text_file_busy_retry;
use quill_core::remove_file_if_exists;
use quill_skill_cache::{
    SkillJobError, SkillJobExecutor, SkillJobOutcome, SkillJobRequest, SkillProgressSink,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, Command};

use crate::catalog::{render_skill_template, CommandSkillSpec};

pub const SKILL_ID_ENV: &str = "QUILL_SKILL_ID";
pub const SKILL_INPUT_ENV: &str = "QUILL_SKILL_INPUT";
const STDERR_TAIL_LINES: usize = 20;
const MAX_SUMMARY_CHARS: usize = 240;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Runs a skill as a one-shot program and returns its stdout or output file.
pub struct CommandSkillExecutor {
    spec: CommandSkillSpec,
}

impl CommandSkillExecutor {
    pub fn new(spec: CommandSkillSpec) -> Result<Self> {
        if spec.program.trim().is_empty() {
            bail!("command program must be non-empty");
        }
        if spec.timeout_ms == 0 {
            bail!("command timeout must be greater than 0ms");
        }
        Ok(Self { spec })
    }

    pub fn spec(&self) -> &CommandSkillSpec {
        &self.spec
    }

    fn output_path(&self, skill_id: &str, input: &str) -> Option<PathBuf> {
        let rendered = PathBuf::from(render_skill_template(
            self.spec.output_file.as_deref()?,
            skill_id,
            input,
        ));
        match &self.spec.working_dir {
            Some(dir) if rendered.is_relative() => Some(dir.join(rendered)),
            _ => Some(rendered),
        }
    }
}

#[async_trait]
impl SkillJobExecutor for CommandSkillExecutor {
    async fn execute(&self, request: SkillJobRequest) -> SkillJobOutcome {
        let program = self.spec.program.trim();
        let skill_id = request.skill_id.as_str();
        let input = request.input.as_deref().unwrap_or_default();
        let output_path = self.output_path(skill_id, input);
        if let Some(path) = &output_path {
            remove_file_if_exists(path)?;
        }

        let mut command = Command::new(program);
        command.kill_on_drop(true);
        command.args(
            self.spec
                .args
                .iter()
                .map(|arg| render_skill_template(arg, skill_id, input)),
        );
        command.envs(&self.spec.env);
        command.env(SKILL_ID_ENV, skill_id);
        command.env(SKILL_INPUT_ENV, input);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = spawn_with_text_file_busy_retry(&mut command)
            .await
            .map_err(|error| {
                SkillJobError::spawn_failed(format!("failed to spawn skill command '{program}': {error}"))
            })?;
        tracing::debug!(skill_id = %skill_id, pid = child.id(), "skill command started");
        let stdout = child.stdout.take();
        let stderr_task = tokio::spawn(forward_stderr(child.stderr.take(), request.progress.clone()));

        let timeout = Duration::from_millis(self.spec.timeout_ms);
        let waited = tokio::time::timeout(timeout, async {
            let mut captured = Vec::new();
            if let Some(mut stdout) = stdout {
                stdout.read_to_end(&mut captured).await?;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, captured))
        })
        .await;
        let (status, captured) = match waited {
            Ok(Ok(finished)) => finished,
            Ok(Err(error)) => {
                stderr_task.abort();
                return Err(SkillJobError::execution_failed(format!(
                    "skill command '{program}' execution failed: {error}"
                )));
            }
            Err(_) => {
                if let Err(error) = child.kill().await {
                    tracing::warn!(skill_id = %skill_id, error = %error, "failed to kill timed out skill command");
                }
                stderr_task.abort();
                return Err(SkillJobError::timeout(format!(
                    "skill command '{program}' timed out after {}ms",
                    self.spec.timeout_ms
                )));
            }
        };
        let stderr_tail = stderr_task.await.unwrap_or_default();
        let stdout = String::from_utf8_lossy(&captured).to_string();

        if !status.success() {
            let status = status
                .code()
                .map(|value| value.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let summary = summarize_process_failure(&stderr_tail, &stdout);
            return Err(SkillJobError::execution_failed(format!(
                "skill command '{program}' exited with status {status}: {summary}"
            )));
        }

        let content = match &output_path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(content) => content,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    return Err(SkillJobError::missing_output(format!(
                        "output file not found: {}",
                        path.display()
                    )));
                }
                Err(error) => {
                    return Err(SkillJobError::execution_failed(format!(
                        "failed to read output file {}: {error}",
                        path.display()
                    )));
                }
            },
            None => stdout,
        };
        let content = content.trim();
        if content.is_empty() {
            return Err(SkillJobError::missing_output(format!(
                "skill command '{program}' produced no output"
            )));
        }
        if self.spec.expect_json {
            validate_json_output(content)?;
        }
        Ok(content.to_string())
    }
}

/// Rejects output that is not a JSON document.
pub fn validate_json_output(content: &str) -> Result<(), SkillJobError> {
    serde_json::from_str::<serde_json::Value>(content)
        .map(|_| ())
        .map_err(|error| SkillJobError::parse(format!("failed to parse skill output as JSON: {error}")))
}

async fn forward_stderr(stderr: Option<ChildStderr>, progress: Option<SkillProgressSink>) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };
    let mut tail = Vec::new();
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(progress) = &progress {
            progress(line);
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.remove(0);
        }
        tail.push(line.to_string());
    }
    tail.join("\n")
}

fn summarize_process_failure(stderr: &str, stdout: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return truncate_for_log(stderr);
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return truncate_for_log(stdout);
    }
    "no error output".to_string()
}

fn truncate_for_log(text: &str) -> String {
    if text.chars().count() <= MAX_SUMMARY_CHARS {
        return text.to_string();
    }
    text.chars().take(MAX_SUMMARY_CHARS).collect::<String>() + "..."
}

#[cfg(test)]
mod tests {
    use super::{validate_json_output, CommandSkillExecutor};
    use crate::catalog::CommandSkillSpec;
    use quill_skill_cache::{SkillJobErrorKind, SkillJobExecutor, SkillJobRequest};

    fn spec(program: &str) -> CommandSkillSpec {
        CommandSkillSpec {
            program: program.to_string(),
            args: Vec::new(),
            env: Default::default(),
            working_dir: None,
            output_file: None,
            expect_json: false,
            timeout_ms: 5_000,
        }
    }

    #[test]
    fn unit_command_executor_rejects_invalid_spec() {
        assert!(CommandSkillExecutor::new(spec(" ")).is_err());
        let mut zero = spec("/bin/true");
        zero.timeout_ms = 0;
        assert!(CommandSkillExecutor::new(zero).is_err());
    }

    #[test]
    fn unit_validate_json_output_classifies_parse_failures() {
        assert!(validate_json_output(r#"{"items":[]}"#).is_ok());
        let error = validate_json_output("not json").expect_err("parse");
        assert_eq!(error.kind, SkillJobErrorKind::Parse);
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn regression_missing_program_reports_spawn_failure() {
        let executor =
            CommandSkillExecutor::new(spec("/nonexistent/quill-skill")).expect("executor");
        let error = executor
            .execute(SkillJobRequest::new("trending", None))
            .await
            .expect_err("spawn");
        assert_eq!(error.kind, SkillJobErrorKind::SpawnFailed);
        assert!(!error.is_retryable());
    }

    #[cfg(unix)]
    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, body).expect("write script");
        let mut permissions = std::fs::metadata(&path).expect("metadata").permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn integration_command_templates_args_and_exports_env() {
        use std::sync::{Arc, Mutex};

        let temp = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            temp.path(),
            "skill.sh",
            r#"#!/bin/sh
echo "working on $QUILL_SKILL_ID" >&2
printf '{"arg":"%s","env":"%s"}\n' "$1" "$QUILL_SKILL_INPUT"
"#,
        );
        let mut command = spec(&script.display().to_string());
        command.args = vec!["{skill_id}/{input}".to_string()];
        command.expect_json = true;
        let executor = CommandSkillExecutor::new(command).expect("executor");

        let progress = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&progress);
        let request = SkillJobRequest::new("topics:ai", Some("ai".to_string())).with_progress(
            Arc::new(move |line: &str| sink.lock().expect("progress").push(line.to_string())),
        );
        let content = executor.execute(request).await.expect("content");
        assert_eq!(content, r#"{"arg":"topics:ai/ai","env":"ai"}"#);
        assert_eq!(
            progress.lock().expect("progress").clone(),
            vec!["working on topics:ai".to_string()]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn functional_command_reads_output_file_relative_to_working_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            temp.path(),
            "skill.sh",
            "#!/bin/sh\nprintf 'report for %s' \"$QUILL_SKILL_INPUT\" > \"out-$QUILL_SKILL_INPUT.txt\"\n",
        );
        let mut command = spec(&script.display().to_string());
        command.working_dir = Some(temp.path().to_path_buf());
        command.output_file = Some("out-{input}.txt".to_string());
        let executor = CommandSkillExecutor::new(command).expect("executor");
        let content = executor
            .execute(SkillJobRequest::new("news", Some("world".to_string())))
            .await
            .expect("content");
        assert_eq!(content, "report for world");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn regression_command_failures_map_to_error_kinds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let failing = write_script(temp.path(), "fail.sh", "#!/bin/sh\necho boom >&2\nexit 42\n");
        let silent = write_script(temp.path(), "silent.sh", "#!/bin/sh\nexit 0\n");
        let garbled = write_script(temp.path(), "garbled.sh", "#!/bin/sh\necho '{oops'\n");
        let slow = write_script(temp.path(), "slow.sh", "#!/bin/sh\nsleep 5\n");

        let run = |program: &std::path::Path, configure: fn(&mut CommandSkillSpec)| {
            let mut command = spec(&program.display().to_string());
            configure(&mut command);
            async move {
                CommandSkillExecutor::new(command)
                    .expect("executor")
                    .execute(SkillJobRequest::new("trending", None))
                    .await
                    .expect_err("failure")
            }
        };

        let error = run(failing.as_path(), |_| {}).await;
        assert_eq!(error.kind, SkillJobErrorKind::ExecutionFailed);
        assert!(error.message.contains("status 42: boom"));

        let error = run(silent.as_path(), |_| {}).await;
        assert_eq!(error.kind, SkillJobErrorKind::MissingOutput);

        let error = run(silent.as_path(), |command| {
            command.output_file = Some("/nonexistent/quill-output.json".to_string())
        })
        .await;
        assert_eq!(error.kind, SkillJobErrorKind::MissingOutput);
        assert!(error.message.contains("output file not found"));

        let error = run(garbled.as_path(), |command| command.expect_json = true).await;
        assert_eq!(error.kind, SkillJobErrorKind::Parse);

        let error = run(slow.as_path(), |command| command.timeout_ms = 100).await;
        assert_eq!(error.kind, SkillJobErrorKind::Timeout);
        assert!(!error.is_retryable());
    }
}
