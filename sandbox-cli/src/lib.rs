//! CLI surface: argument parsing, configuration-file loading, logging
//! setup, and the exit-code mapping from `SandboxError`.
//!
//! `clap` derive args, `tracing_subscriber::fmt::init()`, and a thin
//! `main` delegating into this library crate.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use sandbox_core::Orchestrator;
use sandbox_core::SandboxError;
use sandbox_core::WrappedCommand;
use sandbox_policy::Configuration;
use tokio::io::AsyncBufReadExt;

/// Hardcoded, absolute path to macOS's unified-logging CLI, mirroring
/// `sandbox-compiler`'s `HOST_A_LAUNCHER_PATH`/`HOST_B_LAUNCHER_PATH`
/// convention of never resolving a security-relevant helper through `PATH`.
const HOST_A_LOG_STREAM_PATH: &str = "/usr/bin/log";

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_INVALID_CONFIG: i32 = 64;
pub const EXIT_SANDBOX_SETUP_FAILURE: i32 = 65;
pub const EXIT_PRE_COMMAND_FAILURE: i32 = 66;
pub const EXIT_INTERNAL_ERROR: i32 = 70;

#[derive(Debug, Parser)]
#[command(name = "sandbox-cli", version, about = "Runs a command under filesystem and network sandboxing.")]
pub struct Cli {
    /// The user command to run, as a single quoted shell string.
    pub command: String,

    /// Alternative path to a JSON configuration file.
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Enables verbose audit logging.
    #[arg(long)]
    pub debug: bool,
}

/// Parses arguments, loads configuration, initializes the Orchestrator,
/// runs the wrapped command, and returns the process exit code this
/// binary should exit with.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run_inner(&cli).await {
        Ok(exit_code) => exit_code,
        Err(err) => {
            tracing::error!(error = %err, "sandbox-cli failed");
            exit_code_for_report(&err)
        }
    }
}

async fn run_inner(cli: &Cli) -> anyhow::Result<i32> {
    let config = load_configuration(cli.settings.as_deref())
        .context("loading sandbox configuration")
        .map_err(|err| reported(EXIT_INVALID_CONFIG, err))?;

    let orchestrator = Orchestrator::global();
    orchestrator
        .initialize(config.clone())
        .await
        .map_err(|err| reported(exit_code_for(&err), err))?;

    let argv = shlex::split(&cli.command).ok_or_else(|| {
        reported(
            EXIT_INVALID_CONFIG,
            anyhow::anyhow!("command could not be tokenized: {}", cli.command),
        )
    })?;

    let wrapped = orchestrator
        .wrap_with_sandbox(&argv)
        .await
        .map_err(|err| reported(exit_code_for(&err), err))?;

    let status = run_wrapped_command_with_audit(orchestrator, &config, &wrapped).await;
    orchestrator.reset().await;

    let status = status.map_err(|err| reported(EXIT_INTERNAL_ERROR, err))?;
    Ok(exit_code_from_status(status))
}

/// Runs the wrapped command while driving whichever Audit Ingest path
/// matches the host the Orchestrator compiled for: Host-A tails a live
/// audit stream concurrently with the child, Host-B
/// synthesizes violations from before/after filesystem snapshots once the
/// child exits. Recorded violations are attributed to `wrapped.execution_id`
/// via `Orchestrator::record_violations` so they land in the same Violation
/// Store the proxies feed.
async fn run_wrapped_command_with_audit(
    orchestrator: &'static Orchestrator,
    config: &Configuration,
    wrapped: &WrappedCommand,
) -> std::io::Result<std::process::ExitStatus> {
    match orchestrator.is_host_a().await {
        Some(true) => run_with_host_a_audit(orchestrator, wrapped).await,
        _ => run_with_host_b_audit(orchestrator, config, wrapped).await,
    }
}

/// Host-A: tails `log stream` for the duration of the child and forwards
/// each parsed line to `record_violations` as it's observed, matching
/// Audit Ingest (A)'s streaming nature. The tail is best-effort: if `log`
/// can't be spawned, the run proceeds without live violation ingest rather
/// than failing the command outright.
async fn run_with_host_a_audit(
    orchestrator: &'static Orchestrator,
    wrapped: &WrappedCommand,
) -> std::io::Result<std::process::ExitStatus> {
    let tail = spawn_host_a_audit_tail(orchestrator, wrapped.execution_id, wrapped.encoded_command.clone());
    let status = run_wrapped_command(&wrapped.script).await;
    if let Some(tail) = tail {
        tail.abort();
    }
    status
}

fn spawn_host_a_audit_tail(
    orchestrator: &'static Orchestrator,
    execution_id: u64,
    encoded_command: String,
) -> Option<tokio::task::JoinHandle<()>> {
    let mut command = tokio::process::Command::new(HOST_A_LOG_STREAM_PATH);
    command
        .args(["stream", "--style", "ndjson", "--predicate", "eventMessage contains \"Sandbox:\""])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(error = %err, "failed to start host-a audit stream tail; continuing without live violation ingest");
            return None;
        }
    };
    let Some(stdout) = child.stdout.take() else {
        return None;
    };

    Some(tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(parsed) = sandbox_core::parse_audit_a_line(&line) {
                        orchestrator
                            .record_violations(execution_id, &encoded_command, vec![parsed])
                            .await;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "host-a audit stream read failed; continuing without further live ingest");
                    break;
                }
            }
        }
        let _ = child.wait().await;
    }))
}

/// Host-B: snapshots the filesystem policy's denied-write paths before and
/// after running the child, then hands `synthesize_violations` the exit
/// outcome and both snapshots. When `enable_weaker_nested_sandbox` is set,
/// the child's stderr is additionally teed line-by-line (still forwarded
/// to the CLI's own stderr so the user sees unchanged output) to catch the
/// syscall-filter helper's best-effort install-failure marker.
async fn run_with_host_b_audit(
    orchestrator: &'static Orchestrator,
    config: &Configuration,
    wrapped: &WrappedCommand,
) -> std::io::Result<std::process::ExitStatus> {
    let watched_paths: Vec<String> = config
        .filesystem
        .deny_write
        .iter()
        .chain(config.filesystem.deny_within_allow_write.iter())
        .cloned()
        .collect();
    let before = sandbox_core::snapshot_paths(watched_paths.iter());

    let (status, filter_install_failed) = if config.enable_weaker_nested_sandbox {
        run_wrapped_command_tee_stderr(&wrapped.script).await?
    } else {
        (run_wrapped_command(&wrapped.script).await?, false)
    };

    let after = sandbox_core::snapshot_paths(watched_paths.iter());
    let exit = sandbox_core::ExitOutcome::from_status(status);
    let mut violations = sandbox_core::synthesize_violations(&config.filesystem, &exit, &before, &after);
    if filter_install_failed {
        violations.push(sandbox_core::filter_install_failed_violation());
    }

    if !violations.is_empty() {
        orchestrator
            .record_violations(wrapped.execution_id, &wrapped.encoded_command, violations)
            .await;
    }

    Ok(status)
}

/// Runs the command with its stderr piped instead of inherited so each line
/// can be scanned for `FILTER_INSTALL_FAILED_MARKER`, echoing every line to
/// the CLI process's own stderr as it's read so the child's output still
/// reaches the user unchanged.
async fn run_wrapped_command_tee_stderr(
    script: &str,
) -> std::io::Result<(std::process::ExitStatus, bool)> {
    let mut child = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .stderr(std::process::Stdio::piped())
        .spawn()?;
    let Some(stderr) = child.stderr.take() else {
        return Err(std::io::Error::other("stderr requested as piped"));
    };

    let mut filter_install_failed = false;
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Some(line) = lines.next_line().await? {
        eprintln!("{line}");
        if !filter_install_failed && sandbox_core::detect_filter_install_failure(&line) {
            filter_install_failed = true;
        }
    }

    let status = child.wait().await?;
    Ok((status, filter_install_failed))
}

/// Wraps any error into an `anyhow::Error` carrying the exit code it should
/// map to, so `run()`'s top-level handler can recover the code without
/// re-deriving it from an opaque error.
fn reported<E: Into<anyhow::Error>>(code: i32, err: E) -> anyhow::Error {
    anyhow::Error::new(ReportedError(code, err.into()))
}

/// Runs the shell-executable string `wrap_with_sandbox` produced: it must
/// be directly executable by the user's shell of choice (POSIX-compatible
/// assumptions).
async fn run_wrapped_command(script: &str) -> std::io::Result<std::process::ExitStatus> {
    tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .status()
        .await
}

#[cfg(unix)]
fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => status.signal().map(|signal| 128 + signal).unwrap_or(EXIT_INTERNAL_ERROR),
    }
}

#[cfg(not(unix))]
fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_INTERNAL_ERROR)
}

/// Maps a `SandboxError` surfaced by `initialize`/`wrap_with_sandbox` to
/// its reserved exit code. `PreCommandFailed` is not matched here: it
/// never reaches the CLI as a `Result` error, since `wrap_with_sandbox`
/// embeds the `pre_command` failure directly as an `exit 66` in the
/// wrapped script (see `orchestrator::wrap_with_sandbox`).
fn exit_code_for(err: &SandboxError) -> i32 {
    match err {
        SandboxError::InvalidConfig { .. } => EXIT_INVALID_CONFIG,
        SandboxError::AlreadyInitializedWithDifferentConfig => EXIT_SANDBOX_SETUP_FAILURE,
        SandboxError::ProxyBindFailure { .. } => EXIT_SANDBOX_SETUP_FAILURE,
        SandboxError::HostNotSupported => EXIT_SANDBOX_SETUP_FAILURE,
        SandboxError::ToolchainMissing { .. } => EXIT_SANDBOX_SETUP_FAILURE,
        SandboxError::PreCommandFailed { .. } => EXIT_PRE_COMMAND_FAILURE,
        SandboxError::InternalError { .. } => EXIT_INTERNAL_ERROR,
    }
}

/// A `run_inner` failure already carrying its intended exit code, so
/// `run()`'s top-level match doesn't need to re-derive it from an opaque
/// `anyhow::Error`.
#[derive(Debug)]
struct ReportedError(i32, anyhow::Error);

impl std::fmt::Display for ReportedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.1)
    }
}

impl std::error::Error for ReportedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.1.source()
    }
}

fn exit_code_for_report(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ReportedError>()
        .map(|reported| reported.0)
        .unwrap_or(EXIT_INTERNAL_ERROR)
}

/// Loads configuration from `--settings` if given, otherwise from the
/// default discovery path under `HOME`. Missing default config (no
/// `--settings`, no file at the default path) is not an error: an empty
/// `Configuration` applies no restrictions, matching
/// `Configuration::default()`.
fn load_configuration(settings: Option<&Path>) -> anyhow::Result<Configuration> {
    let path = match settings {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path(),
    };

    let Some(path) = path else {
        return Ok(Configuration::default());
    };

    if settings.is_none() && !path.exists() {
        return Ok(Configuration::default());
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("reading configuration file at {}", path.display()))?;
    let config: Configuration = serde_json::from_str(&contents)
        .with_context(|| format!("parsing configuration file at {}", path.display()))?;
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".sandbox.json"))
}

fn init_logging(debug_flag: bool) {
    let debug = debug_flag || std::env::var_os("DEBUG").is_some();
    let filter = if debug { "debug" } else { "info" };
    let no_color = std::env::var_os("NO_COLOR").is_some();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_ansi(!no_color)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn invalid_config_maps_to_exit_64() {
        let err = SandboxError::InvalidConfig {
            field: "network.http_proxy_port".to_string(),
            reason: "out of range".to_string(),
        };
        assert_eq!(exit_code_for(&err), EXIT_INVALID_CONFIG);
    }

    #[test]
    fn toolchain_missing_maps_to_exit_65() {
        let err = SandboxError::ToolchainMissing {
            tool: "/usr/bin/sandbox-exec".to_string(),
        };
        assert_eq!(exit_code_for(&err), EXIT_SANDBOX_SETUP_FAILURE);
    }

    #[test]
    fn missing_default_config_is_not_an_error() {
        let config = load_configuration(None).expect("default configuration applies");
        assert_eq!(config, Configuration::default());
    }

    #[test]
    fn unknown_field_in_explicit_settings_file_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"bogus": true}"#).expect("write");
        let err = load_configuration(Some(&path)).expect_err("unknown field rejected");
        assert!(err.to_string().contains("parsing configuration file"));
    }

    #[test]
    fn valid_explicit_settings_file_loads() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"network": {"http_proxy_port": 8080}}"#).expect("write");
        let config = load_configuration(Some(&path)).expect("loads");
        assert_eq!(config.network.http_proxy_port, Some(8080));
    }
}
