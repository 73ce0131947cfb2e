use crate::collectors::{CollectError, Collector};
use crate::config::ScriptJob;
use crate::snapshot::{now_unix, Payload, ScriptResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

pub struct ScriptExecutor {
    jobs: Vec<ScriptJob>,
    last_run: HashMap<String, i64>,
}

impl ScriptExecutor {
    pub fn new(jobs: Vec<ScriptJob>) -> Self {
        Self {
            jobs,
            last_run: HashMap::new(),
        }
    }

    pub fn last_run(&self, id: &str) -> Option<i64> {
        self.last_run.get(id).copied()
    }

    pub fn is_due(&self, job: &ScriptJob, now: i64) -> bool {
        let last = self.last_run(&job.id).unwrap_or(0);
        !(job.interval_secs > 0 && last > 0 && now - last < job.interval_secs)
    }

    pub async fn run_due(&mut self, now: i64) -> Vec<ScriptResult> {
        let mut results = Vec::new();
        for job in &self.jobs {
            if !self.is_due(job, now) {
                debug!(script = %job.id, "interval not elapsed, skipping");
                continue;
            }

            let result = execute(job).await;
            if result.success {
                info!(script = %job.id, duration_ms = result.duration_ms, "script finished");
            } else {
                warn!(
                    script = %job.id,
                    exit_code = result.exit_code,
                    error = %result.error,
                    "script failed"
                );
            }
            results.push(result);
            self.last_run.insert(job.id.clone(), now);
        }
        results
    }
}

#[async_trait]
impl Collector for ScriptExecutor {
    fn name(&self) -> &str {
        "script"
    }

    async fn collect(&mut self) -> Result<Payload, CollectError> {
        Ok(Payload::Scripts(self.run_due(now_unix()).await))
    }
}

pub async fn execute(job: &ScriptJob) -> ScriptResult {
    let started = Instant::now();
    let timestamp = now_unix();
    let timeout = match job.timeout_secs {
        0 => DEFAULT_TIMEOUT,
        secs => Duration::from_secs(secs),
    };

    let mut cmd = shell_command(job);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let (status, stdout, stderr) = match cmd.spawn() {
        Ok(child) => run_child(child, timeout).await,
        Err(err) => (
            Err(format!("failed to start: {err}")),
            String::new(),
            String::new(),
        ),
    };

    let (success, exit_code, failure) = match status {
        Ok(status) if status.success() => (true, 0, None),
        Ok(status) => (
            false,
            status.code().unwrap_or(-1),
            Some(describe_status(status)),
        ),
        Err(err) => (false, -1, Some(err)),
    };

    let error = match failure {
        Some(failure) if stderr.is_empty() => failure,
        Some(failure) => format!("{stderr}\n{failure}"),
        None => stderr,
    };

    ScriptResult {
        script_id: job.id.clone(),
        name: job.name.clone(),
        timestamp,
        success,
        output: stdout,
        error,
        exit_code,
        duration_ms: started.elapsed().as_millis() as i64,
    }
}

async fn run_child(
    mut child: Child,
    timeout: Duration,
) -> (Result<ExitStatus, String>, String, String) {
    let stdout = tokio::spawn(read_pipe(child.stdout.take()));
    let stderr = tokio::spawn(read_pipe(child.stderr.take()));

    let status = match time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(err)) => Err(format!("failed to wait for process: {err}")),
        Err(_elapsed) => {
            terminate(&mut child).await;
            Err(format!(
                "timed out after {}",
                humantime::format_duration(timeout)
            ))
        }
    };

    // A background grandchild can hold the pipes open past exit.
    let stdout = drain(stdout).await;
    let stderr = drain(stderr).await;

    (status, stdout, stderr)
}

async fn drain(mut reader: JoinHandle<String>) -> String {
    match time::timeout(PIPE_DRAIN_GRACE, &mut reader).await {
        Ok(Ok(text)) => text,
        Ok(Err(err)) => {
            debug!(error = %err, "pipe reader failed");
            String::new()
        }
        Err(_elapsed) => {
            reader.abort();
            debug!("pipe still open after exit, reader aborted");
            String::new()
        }
    }
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Child::kill only reaches the shell; background jobs it started
        // share the group and are reached by signalling the negative pid.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    if let Err(err) = child.kill().await {
        debug!(error = %err, "kill after timeout failed");
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(err) = pipe.read_to_end(&mut buf).await {
            debug!(error = %err, "pipe read failed");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status: {code}"),
        None => format!("terminated: {status}"),
    }
}

#[cfg(unix)]
fn shell_command(job: &ScriptJob) -> Command {
    let mut line = job.command.clone();
    for arg in &job.args {
        line.push(' ');
        line.push_str(&quote_arg(arg));
    }
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn shell_command(job: &ScriptJob) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(&job.command).args(&job.args);
    cmd
}

fn quote_arg(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}
