//! Sandbox Orchestrator: the process-wide entry point that ties
//! `sandbox-policy`'s Configuration, `sandbox-compiler`'s two
//! host-specific compilers, and `sandbox-proxy`'s servers and Violation
//! Store together.
//!
//! State lives behind a single `tokio::sync::Mutex`-guarded cell. Host-A
//! and Host-B are a closed two-variant enum, not a trait object, so
//! dispatch between them never needs dynamic dispatch.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use sha2::Digest;
use sha2::Sha256;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use sandbox_compiler::HOST_A_LAUNCHER_PATH;
use sandbox_compiler::HOST_B_LAUNCHER_PATH;
use sandbox_compiler::HOST_B_SYSCALL_FILTER_HELPER_PATH;
use sandbox_compiler::HostANetworkParams;
use sandbox_compiler::HostBNetworkParams;
use sandbox_compiler::compile_host_a;
use sandbox_compiler::compile_host_b;
use sandbox_policy::CompiledGlob;
use sandbox_policy::Configuration;
use sandbox_policy::Decision;
use sandbox_policy::HostMatcher;
use sandbox_proxy::ExecutionContext;
use sandbox_proxy::HostEvaluator;
use sandbox_proxy::HttpProxyState;
use sandbox_proxy::Socks5State;
use sandbox_proxy::Subscription;
use sandbox_proxy::UpstreamClient;
use sandbox_proxy::ViolationEvent;
use sandbox_proxy::ViolationKind;
use sandbox_proxy::ViolationStore;
use sandbox_proxy::run_http_proxy_with_std_listener;
use sandbox_proxy::run_socks5_with_std_listener;

use crate::audit_a::ParsedViolation;
use crate::error::ProxyKind;
use crate::error::Result;
use crate::error::SandboxError;

/// `TMPDIR` the wrapped command is given; also the directory bound into the
/// Host-B tmpfs by the compiler.
const SANDBOX_TMPDIR: &str = "/tmp/claude";

/// Grace period `reset()` gives in-flight connections before the aborted
/// accept-loop tasks are dropped outright.
const RESET_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostKind {
    HostA,
    HostB,
}

impl HostKind {
    fn detect() -> Result<Self> {
        if cfg!(target_os = "macos") {
            Ok(Self::HostA)
        } else if cfg!(target_os = "linux") {
            Ok(Self::HostB)
        } else {
            Err(SandboxError::HostNotSupported)
        }
    }

    fn launcher_path(self) -> &'static str {
        match self {
            Self::HostA => HOST_A_LAUNCHER_PATH,
            Self::HostB => HOST_B_LAUNCHER_PATH,
        }
    }

    /// Confirms the host's launcher (and, on Host-B, the syscall-filter
    /// helper) is present and executable. `which::which` is used even
    /// though these paths are already absolute: unlike a bare
    /// `Path::exists` check it also verifies the executable bit, and it
    /// degrades gracefully to a `PATH` search if a future revision of
    /// these constants ever drops the leading `/`.
    fn verify_toolchain(self) -> Result<()> {
        let launcher = self.launcher_path();
        if which::which(launcher).is_err() {
            return Err(SandboxError::ToolchainMissing {
                tool: launcher.to_string(),
            });
        }
        if matches!(self, Self::HostB) && which::which(HOST_B_SYSCALL_FILTER_HELPER_PATH).is_err() {
            return Err(SandboxError::ToolchainMissing {
                tool: HOST_B_SYSCALL_FILTER_HELPER_PATH.to_string(),
            });
        }
        Ok(())
    }
}

/// The shell-executable string `wrap_with_sandbox` produces, plus the
/// execution identity an audit-ingest caller needs to attribute
/// subsequently observed violations to this run via `record_violations`.
#[derive(Debug, Clone)]
pub struct WrappedCommand {
    pub script: String,
    pub execution_id: u64,
    pub encoded_command: String,
}

struct ProxySlot {
    /// `Some` once bound, whether the bind happened locally or the port was
    /// supplied externally by the caller.
    port: Option<u16>,
    /// `None` when the port was supplied externally: no local listener was
    /// started, so there is nothing for `reset` to abort.
    task: Option<JoinHandle<()>>,
}

impl ProxySlot {
    fn external(port: u16) -> Self {
        Self {
            port: Some(port),
            task: None,
        }
    }

    async fn shutdown(self) {
        let Some(task) = self.task else {
            return;
        };
        task.abort();
        let _ = tokio::time::timeout(RESET_GRACE_PERIOD, task).await;
    }
}

struct Initialized {
    config: Configuration,
    host: HostKind,
    http: ProxySlot,
    socks: ProxySlot,
    evaluator: HostEvaluator,
    next_execution_id: u64,
    /// Compiled `ignore_violations.filesystem` patterns, consulted by
    /// `record_violations` when attributing audit-derived filesystem/syscall
    /// violations.
    ignore_filesystem: Vec<CompiledGlob>,
    /// Compiled `ignore_violations.network` patterns; `None` when the list
    /// is empty, matching `HostEvaluator`'s own "skip the lookup" shortcut.
    ignore_network: Option<Arc<HostMatcher>>,
}

enum State {
    Uninitialized,
    Initialized(Box<Initialized>),
}

/// The process-wide sandbox state cell. Obtain the single instance via
/// [`Orchestrator::global`]; the Design Notes call for at most one live
/// instance per process, enforced here by never constructing a second one.
pub struct Orchestrator {
    state: Mutex<State>,
    violations: ViolationStore,
}

static ORCHESTRATOR: OnceLock<Orchestrator> = OnceLock::new();

impl Orchestrator {
    pub fn global() -> &'static Orchestrator {
        ORCHESTRATOR.get_or_init(|| Orchestrator {
            state: Mutex::new(State::Uninitialized),
            violations: ViolationStore::new(),
        })
    }

    /// Validates `config`, compiles a Host-Matcher for it, and starts
    /// whichever proxy wasn't given an external port. Idempotent when
    /// called again with a structurally equal `config`; rejects a
    /// differing one without touching existing state.
    pub async fn initialize(&self, config: Configuration) -> Result<()> {
        config.validate()?;

        let mut state = self.state.lock().await;
        if let State::Initialized(existing) = &*state {
            if existing.config == config {
                tracing::info!("initialize called again with an equal configuration; no-op");
                return Ok(());
            }
            return Err(SandboxError::AlreadyInitializedWithDifferentConfig);
        }

        let host = HostKind::detect()?;
        host.verify_toolchain()?;

        let matcher = HostMatcher::compile(&config.network.allowed_domains, &config.network.denied_domains)?;

        let ignore_filesystem = sandbox_policy::compile_glob_all(&config.ignore_violations.filesystem)
            .map_err(|err| SandboxError::InvalidConfig {
                field: "ignore_violations.filesystem".to_string(),
                reason: format!("pattern `{}`: {}", err.pattern, err.reason),
            })?;
        let ignore_network = if config.ignore_violations.network.is_empty() {
            None
        } else {
            Some(Arc::new(
                HostMatcher::compile(&config.ignore_violations.network, &[]).map_err(|err| {
                    SandboxError::InvalidConfig {
                        field: "ignore_violations.network".to_string(),
                        reason: err.reason,
                    }
                })?,
            ))
        };

        let evaluator = HostEvaluator::with_ignore_matcher(
            Arc::new(matcher),
            ignore_network.clone(),
            self.violations.clone(),
            ExecutionContext {
                execution_id: None,
                encoded_command: String::new(),
            },
        );

        let http = self
            .start_proxy(ProxyKind::Http, config.network.http_proxy_port, evaluator.clone())
            .await?;
        let socks = match self
            .start_proxy(ProxyKind::Socks5, config.network.socks_proxy_port, evaluator.clone())
            .await
        {
            Ok(slot) => slot,
            Err(err) => {
                http.shutdown().await;
                return Err(err);
            }
        };

        tracing::info!(
            host = ?host,
            http_port = http.port,
            socks_port = socks.port,
            "sandbox orchestrator initialized"
        );

        *state = State::Initialized(Box::new(Initialized {
            config,
            host,
            http,
            socks,
            evaluator,
            next_execution_id: 1,
            ignore_filesystem,
            ignore_network,
        }));
        Ok(())
    }

    async fn start_proxy(
        &self,
        kind: ProxyKind,
        configured_port: Option<u16>,
        evaluator: HostEvaluator,
    ) -> Result<ProxySlot> {
        if let Some(port) = configured_port {
            tracing::info!(port, %kind, "proxy port supplied externally; no local listener started");
            return Ok(ProxySlot::external(port));
        }

        let bind_failure = |cause: std::io::Error| SandboxError::ProxyBindFailure {
            which: kind,
            port: None,
            cause: cause.to_string(),
        };

        let std_listener = std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(bind_failure)?;
        std_listener.set_nonblocking(true).map_err(bind_failure)?;
        let port = std_listener.local_addr().map_err(bind_failure)?.port();

        let task = match kind {
            ProxyKind::Http => {
                let state = Arc::new(HttpProxyState {
                    evaluator,
                    upstream: UpstreamClient::direct(),
                });
                tokio::spawn(async move {
                    if let Err(err) = run_http_proxy_with_std_listener(state, std_listener).await {
                        tracing::error!(error = %err, "http proxy accept loop exited");
                    }
                })
            }
            ProxyKind::Socks5 => {
                let state = Arc::new(Socks5State { evaluator });
                tokio::spawn(async move {
                    if let Err(err) = run_socks5_with_std_listener(state, std_listener).await {
                        tracing::error!(error = %err, "socks5 accept loop exited");
                    }
                })
            }
        };

        tracing::info!(port, %kind, "local proxy bound");
        Ok(ProxySlot {
            port: Some(port),
            task: Some(task),
        })
    }

    pub async fn get_proxy_port(&self) -> Option<u16> {
        match &*self.state.lock().await {
            State::Initialized(init) => init.http.port,
            State::Uninitialized => None,
        }
    }

    pub async fn get_socks_proxy_port(&self) -> Option<u16> {
        match &*self.state.lock().await {
            State::Initialized(init) => init.socks.port,
            State::Uninitialized => None,
        }
    }

    pub async fn get_env(&self) -> Option<indexmap::IndexMap<String, String>> {
        match &*self.state.lock().await {
            State::Initialized(init) => init.config.env.clone(),
            State::Uninitialized => None,
        }
    }

    pub async fn get_pre_command(&self) -> Option<String> {
        match &*self.state.lock().await {
            State::Initialized(init) => init.config.pre_command.clone(),
            State::Uninitialized => None,
        }
    }

    /// `Some(true)`/`Some(false)` for Host-A/Host-B once initialized, `None`
    /// before `initialize` has run. The CLI uses this to pick which Audit
    /// Ingest path drives a given execution: Host-A's live stream tail vs.
    /// Host-B's post-hoc snapshot synthesis.
    pub async fn is_host_a(&self) -> Option<bool> {
        match &*self.state.lock().await {
            State::Initialized(init) => Some(init.host == HostKind::HostA),
            State::Uninitialized => None,
        }
    }

    /// Feeds parsed filesystem/syscall violations (from either Audit Ingest
    /// path) into the Violation Store, attributing them to `execution_id`
    /// and marking `suppressed` for any subject matching the current
    /// `ignore_violations` lists. Network violations are
    /// recorded directly by `HostEvaluator` instead; this path exists for
    /// the violations only the audit stream or post-hoc synthesis can see.
    pub async fn record_violations(&self, execution_id: u64, encoded_command: &str, parsed: Vec<ParsedViolation>) {
        let state = self.state.lock().await;
        let State::Initialized(init) = &*state else {
            return;
        };
        for violation in parsed {
            let suppressed = is_suppressed(&violation, &init.ignore_filesystem, init.ignore_network.as_deref());
            self.violations.add(sandbox_proxy::NewViolation {
                execution_id: Some(execution_id),
                kind: violation.kind,
                subject: violation.subject,
                pid: violation.pid,
                raw: violation.raw,
                encoded_command: encoded_command.to_string(),
                suppressed,
            });
        }
    }

    /// Selects the host's compiler, compiles the current policy, and
    /// assembles a shell-executable string: environment variable exports,
    /// an optional `pre_command` gate that exits `66` on failure (matching
    /// the CLI's own exit-code contract), then an `exec` into the host
    /// launcher wrapping `command`.
    pub async fn wrap_with_sandbox(&self, command: &[String]) -> Result<WrappedCommand> {
        let mut state = self.state.lock().await;
        let State::Initialized(init) = &mut *state else {
            return Err(SandboxError::InternalError {
                context: "wrap_with_sandbox called before initialize".to_string(),
            });
        };

        let execution_id = init.next_execution_id;
        init.next_execution_id += 1;
        let command_hash = encoded_command(command);
        init.evaluator.set_context(ExecutionContext {
            execution_id: Some(execution_id),
            encoded_command: command_hash.clone(),
        });

        let cwd = std::env::current_dir().map_err(|err| SandboxError::InternalError {
            context: format!("failed to read current directory: {err}"),
        })?;

        let (launcher_path, launcher_args) = match init.host {
            HostKind::HostA => {
                let plan = compile_host_a(
                    &init.config,
                    &cwd,
                    &HostANetworkParams {
                        http_proxy_port: init.http.port,
                        socks_proxy_port: init.socks.port,
                    },
                )
                .map_err(|err| SandboxError::InternalError {
                    context: format!("Host-A profile compilation failed: {err}"),
                })?;
                (HOST_A_LAUNCHER_PATH.to_string(), plan.launcher_args(command))
            }
            HostKind::HostB => {
                let plan = compile_host_b(
                    &init.config,
                    &cwd,
                    Path::new("/"),
                    &HostBNetworkParams {
                        http_proxy_port: init.http.port,
                        socks_proxy_port: init.socks.port,
                    },
                )
                .map_err(|err| SandboxError::InternalError {
                    context: format!("Host-B plan compilation failed: {err}"),
                })?;
                (HOST_B_LAUNCHER_PATH.to_string(), plan.launcher_args(command))
            }
        };

        let mut script = String::new();
        for (key, value) in proxy_and_runtime_env(init.http.port, init.socks.port) {
            script.push_str(&format!("export {key}={}\n", quote(&value)?));
        }
        if let Some(env) = &init.config.env {
            for (key, value) in env {
                script.push_str(&format!("export {key}={}\n", quote(value)?));
            }
        }
        if let Some(pre_command) = &init.config.pre_command {
            script.push_str(pre_command);
            script.push_str(" || exit 66\n");
        }

        let mut argv = vec![launcher_path];
        argv.extend(launcher_args);
        script.push_str("exec ");
        script.push_str(&shlex::try_join(argv.iter().map(String::as_str)).map_err(|err| {
            SandboxError::InternalError {
                context: format!("failed to quote launcher argv: {err}"),
            }
        })?);

        Ok(WrappedCommand {
            script,
            execution_id,
            encoded_command: command_hash,
        })
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&[ViolationEvent]) + Send + Sync + 'static,
    ) -> Subscription {
        self.violations.subscribe(callback)
    }

    pub fn subscribe_to_execution(
        &self,
        execution_id: u64,
        callback: impl Fn(&[ViolationEvent]) + Send + Sync + 'static,
    ) -> Subscription {
        self.violations.subscribe_to_execution(execution_id, callback)
    }

    /// Stops any locally started proxies, waiting up to `RESET_GRACE_PERIOD`
    /// for their accept loops to unwind after being cancelled, then drops
    /// them. Safe to call from `Uninitialized`.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if let State::Initialized(init) = std::mem::replace(&mut *state, State::Uninitialized) {
            init.http.shutdown().await;
            init.socks.shutdown().await;
        }
        drop(state);
        self.violations.clear();
        self.violations.clear_subscribers();
    }
}

/// Decides whether a parsed audit violation matches `ignore_violations`:
/// filesystem kinds are tested against the compiled glob set, `Network`
/// against the compiled ignore-host matcher, and
/// `SyscallDenied`/`Other` are never suppressed (the ignore lists only
/// name filesystem and network subjects).
fn is_suppressed(
    violation: &ParsedViolation,
    ignore_filesystem: &[CompiledGlob],
    ignore_network: Option<&HostMatcher>,
) -> bool {
    match violation.kind {
        ViolationKind::FsRead | ViolationKind::FsWrite => {
            sandbox_policy::glob_matches_any(ignore_filesystem, Path::new(&violation.subject))
        }
        ViolationKind::Network => ignore_network.is_some_and(|matcher| {
            let (host, port) = split_host_port(&violation.subject);
            matches!(matcher.evaluate(host, port), Decision::Allow)
        }),
        ViolationKind::SyscallDenied | ViolationKind::Other => false,
    }
}

/// Splits a `host:port` subject (as recorded by `HostEvaluator`/audit
/// parsers) back into its parts; malformed subjects fall back to port 0,
/// which simply never matches a specific-port ignore pattern.
fn split_host_port(subject: &str) -> (&str, u16) {
    match subject.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(0)),
        None => (subject, 0),
    }
}

fn proxy_and_runtime_env(http_port: Option<u16>, socks_port: Option<u16>) -> Vec<(&'static str, String)> {
    let mut env = Vec::new();
    if let Some(port) = http_port {
        env.push(("HTTP_PROXY", format!("http://localhost:{port}")));
        env.push(("HTTPS_PROXY", format!("http://localhost:{port}")));
    }
    if let Some(port) = socks_port {
        env.push(("ALL_PROXY", format!("socks5://localhost:{port}")));
    }
    env.push(("NO_PROXY", String::new()));
    env.push(("SANDBOX_RUNTIME", "1".to_string()));
    env.push(("TMPDIR", SANDBOX_TMPDIR.to_string()));
    env
}

fn quote(value: &str) -> Result<String> {
    shlex::try_join(std::iter::once(value)).map_err(|err| SandboxError::InternalError {
        context: format!("failed to quote env value: {err}"),
    })
}

/// Stable, collision-resistant identifier for a command, used to correlate
/// a wrapped execution with the violations it produces without echoing the
/// full (possibly sensitive) argv into the Violation Store.
fn encoded_command(command: &[String]) -> String {
    let joined = shlex::try_join(command.iter().map(String::as_str))
        .unwrap_or_else(|_| command.join("\u{0}"));
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encoded_command_is_stable_and_distinguishes_distinct_commands() {
        let a = encoded_command(&["echo".to_string(), "hi".to_string()]);
        let a_again = encoded_command(&["echo".to_string(), "hi".to_string()]);
        let b = encoded_command(&["echo".to_string(), "bye".to_string()]);
        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }

    #[test]
    fn env_omits_http_vars_when_http_port_absent() {
        let env = proxy_and_runtime_env(None, Some(1080));
        assert!(!env.iter().any(|(k, _)| *k == "HTTP_PROXY"));
        assert!(env.iter().any(|(k, v)| *k == "ALL_PROXY" && v.contains("1080")));
    }

    #[test]
    fn env_omits_all_proxy_vars_when_both_ports_absent() {
        let env = proxy_and_runtime_env(None, None);
        assert!(!env.iter().any(|(k, _)| *k == "HTTP_PROXY"));
        assert!(!env.iter().any(|(k, _)| *k == "HTTPS_PROXY"));
        assert!(!env.iter().any(|(k, _)| *k == "ALL_PROXY"));
        assert!(env.iter().any(|(k, _)| *k == "NO_PROXY"));
        assert!(env.iter().any(|(k, _)| *k == "SANDBOX_RUNTIME"));
        assert!(env.iter().any(|(k, _)| *k == "TMPDIR"));
    }

    #[test]
    fn path_constants_are_absolute() {
        assert!(PathBuf::from(HOST_A_LAUNCHER_PATH).is_absolute());
        assert!(PathBuf::from(HOST_B_LAUNCHER_PATH).is_absolute());
    }

    #[test]
    fn fs_violation_matching_ignore_glob_is_suppressed() {
        let globs = sandbox_policy::compile_glob_all(&["/tmp/**".to_string()]).expect("compiles");
        let violation = ParsedViolation {
            pid: None,
            kind: ViolationKind::FsRead,
            subject: "/tmp/scratch".to_string(),
            raw: "raw".to_string(),
        };
        assert!(is_suppressed(&violation, &globs, None));

        let outside = ParsedViolation {
            subject: "/etc/shadow".to_string(),
            ..violation
        };
        assert!(!is_suppressed(&outside, &globs, None));
    }

    #[test]
    fn network_violation_matching_ignore_host_is_suppressed() {
        let matcher = HostMatcher::compile(&["*.internal.example.com".to_string()], &[]).expect("compiles");
        let violation = ParsedViolation {
            pid: None,
            kind: ViolationKind::Network,
            subject: "metrics.internal.example.com:443".to_string(),
            raw: "raw".to_string(),
        };
        assert!(is_suppressed(&violation, &[], Some(&matcher)));

        let unrelated = ParsedViolation {
            subject: "evil.example.com:443".to_string(),
            ..violation
        };
        assert!(!is_suppressed(&unrelated, &[], Some(&matcher)));
    }

    #[test]
    fn syscall_denied_is_never_suppressed() {
        let violation = ParsedViolation {
            pid: None,
            kind: ViolationKind::SyscallDenied,
            subject: "killed_by_sigsys".to_string(),
            raw: "raw".to_string(),
        };
        assert!(!is_suppressed(&violation, &[], None));
    }
}
