//! Host-B post-hoc violation synthesis.
//!
//! Host-B has no live audit stream the way Host-A's policy interpreter
//! does: bubblewrap's bind-mount denials and the syscall-filter helper's
//! `EPERM` returns both surface to the child as ordinary failures it
//! handles (or doesn't) on its own, never as a distinguishable signal
//! (the filter rule set returns `EPERM`, never kills the process). A
//! denied syscall is indistinguishable, from the outside, from any other
//! `EPERM`/`EACCES` failure the child reports for itself. This module is
//! therefore inherently best-effort: it synthesises violations from what
//! can be observed after the fact (the child's exit outcome, and
//! before/after snapshots of the paths the filesystem policy names)
//! rather than from a trustworthy live stream.

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use sandbox_policy::FilesystemConfig;
use sandbox_proxy::ViolationKind;

use crate::audit_a::ParsedViolation;

/// Marker the syscall-filter helper (its own generation is out of scope
/// here) is assumed to write to its stderr when invoked with
/// `--best-effort` and its filter fails to install, so the Orchestrator
/// can make the degradation observable.
pub const FILTER_INSTALL_FAILED_MARKER: &str = "SYSCALL_FILTER_INSTALL_FAILED";

pub fn detect_filter_install_failure(helper_stderr_line: &str) -> bool {
    helper_stderr_line.contains(FILTER_INSTALL_FAILED_MARKER)
}

/// Synthesizes the violation recorded when `enable_weaker_nested_sandbox`
/// let a failed filter install continue rather than abort.
pub fn filter_install_failed_violation() -> ParsedViolation {
    ParsedViolation {
        pid: None,
        kind: ViolationKind::SyscallDenied,
        subject: "filter_install_failed".to_string(),
        raw: "syscall filter failed to install under enable_weaker_nested_sandbox; continuing"
            .to_string(),
    }
}

/// A point-in-time snapshot of a single path's existence and
/// modification time, used to infer whether a denied write was attempted
/// despite the sandbox's enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathSnapshot {
    pub existed: bool,
    pub modified_ms: Option<i64>,
}

pub fn snapshot_path(path: &Path) -> PathSnapshot {
    match std::fs::metadata(path) {
        Ok(metadata) => PathSnapshot {
            existed: true,
            modified_ms: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64),
        },
        Err(_) => PathSnapshot {
            existed: false,
            modified_ms: None,
        },
    }
}

pub fn snapshot_paths<'a>(paths: impl Iterator<Item = &'a String>) -> HashMap<String, PathSnapshot> {
    paths
        .map(|path| (path.clone(), snapshot_path(Path::new(path))))
        .collect()
}

/// The child's exit outcome, used only to detect termination by a signal
/// that would be consistent with a kernel-level denial (e.g. `SIGSYS`);
/// `enable_weaker_nested_sandbox`'s default seccomp action is `Errno`, not
/// `Kill`, so this only fires for a non-default or externally configured
/// filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

const SIGSYS: i32 = 31;

impl ExitOutcome {
    /// Builds an `ExitOutcome` from the child's `std::process::ExitStatus`,
    /// extracting the terminating signal on Unix (there is no signal
    /// concept on non-Unix targets, so `signal` is always `None` there).
    #[cfg(unix)]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            exit_code: status.code(),
            signal: status.signal(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        Self {
            exit_code: status.code(),
            signal: None,
        }
    }
}

/// Synthesizes violations for one Host-B execution from the before/after
/// path snapshots plus the child's exit outcome. Best-effort: a denied
/// write that never touched the filesystem (the common case, since the
/// bind-mount plan already enforces the denial at the kernel level)
/// produces no violation, matching the fact that Host-B's enforcement is
/// preventative rather than audited.
pub fn synthesize_violations(
    config: &FilesystemConfig,
    exit: &ExitOutcome,
    before: &HashMap<String, PathSnapshot>,
    after: &HashMap<String, PathSnapshot>,
) -> Vec<ParsedViolation> {
    let mut violations = Vec::new();

    let denied_write_paths = config
        .deny_write
        .iter()
        .chain(config.deny_within_allow_write.iter());
    for path in denied_write_paths {
        if let (Some(before), Some(after)) = (before.get(path), after.get(path))
            && before != after
        {
            violations.push(ParsedViolation {
                pid: None,
                kind: ViolationKind::FsWrite,
                subject: path.clone(),
                raw: format!("path `{path}` changed despite being denied for write"),
            });
        }
    }

    if exit.signal == Some(SIGSYS) {
        violations.push(ParsedViolation {
            pid: None,
            kind: ViolationKind::SyscallDenied,
            subject: "killed_by_sigsys".to_string(),
            raw: "child was terminated by SIGSYS".to_string(),
        });
    }

    violations
}

/// Current wall-clock time in milliseconds, used by callers that need to
/// timestamp a synthesized violation the same way the audit-fed path
/// would via `ViolationStore`'s own clock.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn detects_the_filter_install_failed_marker() {
        assert!(detect_filter_install_failure(
            "warning: SYSCALL_FILTER_INSTALL_FAILED: EPERM installing filter"
        ));
        assert!(!detect_filter_install_failure("normal startup log line"));
    }

    #[test]
    fn unchanged_denied_path_produces_no_violation() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("secret");
        fs::write(&path, b"original").expect("write");
        let path_str = path.to_string_lossy().to_string();

        let before = snapshot_paths(std::iter::once(&path_str));
        let after = snapshot_paths(std::iter::once(&path_str));

        let config = FilesystemConfig {
            deny_write: vec![path_str],
            ..FilesystemConfig::default()
        };
        let violations =
            synthesize_violations(&config, &ExitOutcome::default(), &before, &after);
        assert!(violations.is_empty());
    }

    #[test]
    fn changed_denied_path_produces_an_fs_write_violation() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("secret");
        fs::write(&path, b"original").expect("write");
        let path_str = path.to_string_lossy().to_string();

        let before = snapshot_paths(std::iter::once(&path_str));
        std::thread::sleep(std::time::Duration::from_millis(5));
        fs::write(&path, b"mutated").expect("write");
        let after = snapshot_paths(std::iter::once(&path_str));

        let config = FilesystemConfig {
            deny_write: vec![path_str.clone()],
            ..FilesystemConfig::default()
        };
        let violations =
            synthesize_violations(&config, &ExitOutcome::default(), &before, &after);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].subject, path_str);
        assert_eq!(violations[0].kind, ViolationKind::FsWrite);
    }

    #[test]
    fn sigsys_termination_produces_a_syscall_denied_violation() {
        let exit = ExitOutcome {
            exit_code: None,
            signal: Some(SIGSYS),
        };
        let violations = synthesize_violations(
            &FilesystemConfig::default(),
            &exit,
            &HashMap::new(),
            &HashMap::new(),
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::SyscallDenied);
    }
}
