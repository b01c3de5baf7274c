// Subprocess runner shared by the command-backed adapters
// reason: tokio::process for async child management, nix for SIGTERM on shutdown
use freshet_core::application::worker::constants::GRACEFUL_SHUTDOWN_TIMEOUT_MS;
use freshet_core::application::worker::ShutdownToken;
use freshet_core::port::{FetchError, TimeProvider};
use serde::Deserialize;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Default per-command timeout (5 minutes)
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Stderr kept in error messages
const STDERR_TAIL_LEN: usize = 500;

fn default_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}

/// External command description (loaded from configuration)
///
/// Arguments may contain `{name}` placeholders, substituted per invocation
/// (e.g. `{entity}`, `{locator}`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl CommandSpec {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Substitute `{name}` placeholders in the arguments
    pub fn render_args(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{}}}", name), value)
                })
            })
            .collect()
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
}

enum Exit {
    Finished(ExitStatus, Vec<u8>, Vec<u8>),
    Io(std::io::Error),
    TimedOut,
    Cancelled,
}

/// Spawns isolated child processes with environment allowlisting
pub struct CommandRunner {
    time_provider: Arc<dyn TimeProvider>,
    env_allowlist: Vec<String>,
}

impl CommandRunner {
    /// # Arguments
    /// * `env_allowlist` - Variables inherited from the daemon's environment;
    ///   everything else is cleared
    pub fn new(time_provider: Arc<dyn TimeProvider>, env_allowlist: Vec<String>) -> Self {
        Self {
            time_provider,
            env_allowlist,
        }
    }

    fn filter_env(&self, env: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
        env.filter(|(k, _)| self.env_allowlist.contains(k)).collect()
    }

    /// Run `spec` to completion.
    ///
    /// Each var is also exported as `FRESHET_<NAME>`. A timeout or shutdown
    /// terminates the child (SIGTERM, then SIGKILL after the grace period).
    pub async fn run(
        &self,
        spec: &CommandSpec,
        vars: &[(&str, &str)],
        stdin: Option<&[u8]>,
        shutdown: &ShutdownToken,
    ) -> Result<CommandOutput, FetchError> {
        let args = spec.render_args(vars);
        let start_time = self.time_provider.now_millis();

        let mut command = Command::new(&spec.program);
        command
            .args(&args)
            .env_clear()
            .envs(self.filter_env(std::env::vars()))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in vars {
            command.env(format!("FRESHET_{}", name.to_uppercase()), value);
        }

        debug!(program = %spec.program, args = ?args, "Starting command");

        let mut child = command
            .spawn()
            .map_err(|e| FetchError::Other(format!("failed to spawn {}: {}", spec.program, e)))?;

        let stdin_pipe = child.stdin.take();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let input = stdin.map(<[u8]>::to_vec).unwrap_or_default();

        let feed = async move {
            if let Some(mut pipe) = stdin_pipe {
                pipe.write_all(&input).await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let mut shutdown = shutdown.clone();
        let exit = {
            let io = async {
                tokio::try_join!(
                    child.wait(),
                    read_pipe(stdout_pipe),
                    read_pipe(stderr_pipe),
                    feed
                )
            };
            tokio::select! {
                biased;
                _ = shutdown.wait() => Exit::Cancelled,
                res = tokio::time::timeout(spec.timeout(), io) => match res {
                    Ok(Ok((status, out, err, ()))) => Exit::Finished(status, out, err),
                    Ok(Err(e)) => Exit::Io(e),
                    Err(_) => Exit::TimedOut,
                },
            }
        };

        let duration_ms = self.time_provider.now_millis() - start_time;

        match exit {
            Exit::Finished(status, out, err) => {
                let stdout = String::from_utf8_lossy(&out).into_owned();
                let stderr = String::from_utf8_lossy(&err).into_owned();

                if !status.success() {
                    warn!(
                        program = %spec.program,
                        status = %status,
                        duration_ms = duration_ms,
                        "Command failed"
                    );
                    return Err(FetchError::Upstream(format!(
                        "{} {}: {}",
                        spec.program,
                        status,
                        stderr_tail(&stderr)
                    )));
                }

                debug!(program = %spec.program, duration_ms = duration_ms, "Command completed");
                Ok(CommandOutput {
                    stdout,
                    stderr,
                    duration_ms,
                })
            }
            Exit::Io(e) => {
                terminate(&mut child, &spec.program).await;
                Err(FetchError::Other(format!("{} I/O error: {}", spec.program, e)))
            }
            Exit::TimedOut => {
                warn!(program = %spec.program, timeout_ms = spec.timeout_ms, "Command timed out");
                terminate(&mut child, &spec.program).await;
                Err(FetchError::Timeout(spec.timeout_ms))
            }
            Exit::Cancelled => {
                info!(program = %spec.program, "Shutdown requested, terminating command");
                terminate(&mut child, &spec.program).await;
                Err(FetchError::Cancelled)
            }
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_LEN {
        return trimmed;
    }
    let mut start = trimmed.len() - STDERR_TAIL_LEN;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

/// SIGTERM first, then SIGKILL if the child outlives the grace period
async fn terminate(child: &mut Child, program: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    let grace = Duration::from_millis(GRACEFUL_SHUTDOWN_TIMEOUT_MS);
                    if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
                        debug!(pid = pid, program = %program, "Command exited after SIGTERM");
                        return;
                    }
                    warn!(pid = pid, program = %program, "Command ignored SIGTERM, sending SIGKILL");
                }
                Err(e) => warn!(pid = pid, error = %e, "SIGTERM failed"),
            }
        }
    }

    if let Err(e) = child.kill().await {
        warn!(program = %program, error = %e, "Failed to kill command");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use freshet_core::application::worker::shutdown_channel;
    use freshet_core::port::time_provider::SystemTimeProvider;
    use std::time::Instant;

    fn runner() -> CommandRunner {
        CommandRunner::new(Arc::new(SystemTimeProvider), vec!["PATH".to_string()])
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c", script])
    }

    #[test]
    fn test_render_args_substitutes_placeholders() {
        let spec = CommandSpec::new("fetch", ["--symbol={entity}", "{entity}/{locator}", "-v"]);
        let args = spec.render_args(&[("entity", "AAPL"), ("locator", "10-K")]);
        assert_eq!(args, vec!["--symbol=AAPL", "AAPL/10-K", "-v"]);
    }

    #[test]
    fn test_env_filtering() {
        let runner = CommandRunner::new(
            Arc::new(SystemTimeProvider),
            vec!["ALLOWED_VAR".to_string()],
        );
        let env = vec![
            ("ALLOWED_VAR".to_string(), "value1".to_string()),
            ("BLOCKED_VAR".to_string(), "value2".to_string()),
        ];

        let filtered = runner.filter_env(env.into_iter());

        assert_eq!(filtered, vec![("ALLOWED_VAR".to_string(), "value1".to_string())]);
    }

    #[tokio::test]
    async fn test_run_exports_vars() {
        let (_tx, token) = shutdown_channel();
        let output = runner()
            .run(
                &sh("printf '%s' \"$FRESHET_ENTITY\""),
                &[("entity", "MSFT")],
                None,
                &token,
            )
            .await
            .unwrap();

        assert_eq!(output.stdout, "MSFT");
    }

    #[tokio::test]
    async fn test_run_feeds_stdin() {
        let (_tx, token) = shutdown_channel();
        let output = runner()
            .run(&CommandSpec::new("cat", Vec::<String>::new()), &[], Some(b"hello"), &token)
            .await
            .unwrap();

        assert_eq!(output.stdout, "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_upstream_error_with_stderr() {
        let (_tx, token) = shutdown_channel();
        let err = runner()
            .run(&sh("echo oops >&2; exit 3"), &[], None, &token)
            .await
            .unwrap_err();

        match err {
            FetchError::Upstream(msg) => assert!(msg.contains("oops"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (_tx, token) = shutdown_channel();
        let spec = CommandSpec::new("/nonexistent/freshet-command", Vec::<String>::new());
        let err = runner().run(&spec, &[], None, &token).await.unwrap_err();
        assert!(matches!(err, FetchError::Other(_)));
    }

    #[tokio::test]
    async fn test_timeout_terminates_child() {
        let (_tx, token) = shutdown_channel();
        let spec = CommandSpec::new("sleep", ["10"]).with_timeout(Duration::from_millis(100));

        let started = Instant::now();
        let err = runner().run(&spec, &[], None, &token).await.unwrap_err();

        assert!(matches!(err, FetchError::Timeout(100)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_command() {
        let (tx, token) = shutdown_channel();
        let spec = CommandSpec::new("sleep", ["10"]);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.shutdown();
        });

        let started = Instant::now();
        let err = runner().run(&spec, &[], None, &token).await.unwrap_err();

        assert!(matches!(err, FetchError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
