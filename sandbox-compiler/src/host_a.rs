//! Host-A (Seatbelt-style) policy compiler.
//!
//! Produces profile text for a BSD-style policy-kernel interpreter from a
//! `sandbox_policy::Configuration`: deny-all/allow-regex/deny-regex rule
//! ordering, `-D<PARAM>=<value>` directory-parameter substitution, and a
//! hardcoded launcher path that closes the `PATH`-injection gap.

use std::path::Path;
use std::path::PathBuf;

use sandbox_policy::Configuration;
use sandbox_policy::GlobError;
use sandbox_policy::ReadPolicy;
use sandbox_policy::compile_for_host_a;

/// Absolute, hardcoded path to the Seatbelt interpreter. Never resolved
/// through `PATH`.
pub const HOST_A_LAUNCHER_PATH: &str = "/usr/bin/sandbox-exec";

/// Loader search paths every process needs to start, regardless of
/// configuration, under `AllowOnly` read mode — the platform-mandated
/// minimum.
const HOST_A_MANDATED_READ_MINIMUM: &[&str] = &[
    "/usr/lib/**",
    "/usr/bin/**",
    "/bin/**",
    "/System/Library/**",
    "/private/etc/**",
];

/// The two loopback ports a Host-A profile must carve a network exception
/// for, however the network policy otherwise restricts the child.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkParams {
    pub http_proxy_port: Option<u16>,
    pub socks_proxy_port: Option<u16>,
}

/// A compiled Host-A profile plus the `-D` parameter substitutions its
/// `(param "...")` references depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAPlan {
    pub profile_text: String,
    pub params: Vec<(String, PathBuf)>,
}

impl HostAPlan {
    /// Renders the launcher argv (excluding the executable itself): `-p
    /// <profile>`, one `-D<PARAM>=<value>` per parameter, `--`, then the
    /// user command.
    pub fn launcher_args(&self, command: &[String]) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.profile_text.clone()];
        args.extend(
            self.params
                .iter()
                .map(|(key, value)| format!("-D{key}={}", value.to_string_lossy())),
        );
        args.push("--".to_string());
        args.extend(command.iter().cloned());
        args
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Glob(#[from] GlobError),
}

/// Compiles a `Configuration` into a Host-A profile. `cwd` is only bound as
/// the `SANDBOX_POLICY_CWD` parameter so the profile text can reference the
/// preserved working directory; pattern regexes are filesystem-root-
/// relative and do not otherwise depend on it.
pub fn compile_host_a(
    config: &Configuration,
    cwd: &Path,
    network: &NetworkParams,
) -> Result<HostAPlan, CompileError> {
    let mut profile = String::from("(version 1)\n(deny default)\n(debug deny)\n\n");
    profile.push_str(&read_rules(config)?);
    profile.push('\n');
    profile.push_str(&write_rules(config)?);
    profile.push('\n');
    profile.push_str(&network_rules(config, network));
    profile.push('\n');
    profile.push_str(PROCESS_RULES);

    let params = vec![
        ("SANDBOX_POLICY_CWD".to_string(), cwd.to_path_buf()),
        (
            "HOST_A_LAUNCHER".to_string(),
            PathBuf::from(HOST_A_LAUNCHER_PATH),
        ),
    ];

    Ok(HostAPlan {
        profile_text: profile,
        params,
    })
}

fn read_rules(config: &Configuration) -> Result<String, GlobError> {
    let mut out = String::from("; read rules\n");
    match config.filesystem.read_policy {
        ReadPolicy::AllowOnly => {
            let mut allow_read = config.filesystem.allow_read.clone();
            allow_read.extend(HOST_A_MANDATED_READ_MINIMUM.iter().map(ToString::to_string));
            let (allow, _) = compile_for_host_a(&allow_read)?;
            let (deny_within, _) = compile_for_host_a(&config.filesystem.deny_within_allow_read)?;

            out.push_str("(deny file-read*)\n");
            for regex in &allow {
                out.push_str(&format!("(allow file-read* (regex #\"{regex}\"))\n"));
            }
            for regex in &deny_within {
                out.push_str(&format!("(deny file-read* (regex #\"{regex}\"))\n"));
            }
        }
        ReadPolicy::DenyOnly => {
            let (deny, _) = compile_for_host_a(&config.filesystem.deny_read)?;
            out.push_str("(allow file-read*)\n");
            for regex in &deny {
                out.push_str(&format!("(deny file-read* (regex #\"{regex}\"))\n"));
            }
        }
    }
    Ok(out)
}

/// Write rules are always allow-only: an empty `allow_write` leaves the
/// filesystem entirely read-only to the child.
fn write_rules(config: &Configuration) -> Result<String, GlobError> {
    let mut out = String::from("; write rules (always allow-only)\n(deny file-write*)\n");
    let (allow, _) = compile_for_host_a(&config.filesystem.allow_write)?;
    for regex in &allow {
        out.push_str(&format!("(allow file-write* (regex #\"{regex}\"))\n"));
    }

    let mut deny_patterns = config.filesystem.deny_within_allow_write.clone();
    deny_patterns.extend(config.filesystem.deny_write.iter().cloned());
    let (deny, _) = compile_for_host_a(&deny_patterns)?;
    for regex in &deny {
        out.push_str(&format!("(deny file-write* (regex #\"{regex}\"))\n"));
    }
    Ok(out)
}

fn network_rules(config: &Configuration, network: &NetworkParams) -> String {
    let mut out = String::from("; network rules\n(deny network*)\n");
    for port in [network.http_proxy_port, network.socks_proxy_port]
        .into_iter()
        .flatten()
    {
        out.push_str(&format!(
            "(allow network-outbound (remote ip \"127.0.0.1:{port}\"))\n"
        ));
    }
    for socket in &config.network.allowed_unix_sockets {
        out.push_str(&format!(
            "(allow network-outbound (remote unix-socket (path-literal \"{socket}\")))\n"
        ));
    }
    out.push_str("(deny network-outbound (remote ip \"*:53\"))\n");
    out.push_str("(deny network* (socket-type raw))\n");
    out
}

const PROCESS_RULES: &str = "; process rules\n(allow process-fork)\n(allow process-exec)\n(allow signal (target self))\n(deny process-info*)\n(deny system-privilege)\n(deny debug)\n";
