//! Host-B (bubblewrap + seccomp) launch-plan compiler.
//!
//! Builds the `--ro-bind / /` then selective `--bind`/`--ro-bind`
//! re-layering order, plus the `.git`/symlink-decoy defense. `AllowOnly`
//! is implemented by never binding `/` at all and instead binding each
//! effective read path individually, so restricted read access actually
//! restricts reads rather than only restricting writes. The seccomp rule
//! set (deny `ptrace`/`io_uring_*`, restrict `socket`/`socketpair` by
//! address family) is delegated entirely to the prebuilt syscall-filter
//! helper (its own generation is out of scope here); this module only
//! emits the argv it is invoked with.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use sandbox_policy::Configuration;
use sandbox_policy::GlobError;
use sandbox_policy::ReadPolicy;
use sandbox_policy::compile_for_host_b;

/// Absolute, hardcoded path to bubblewrap. Never resolved through `PATH`.
pub const HOST_B_LAUNCHER_PATH: &str = "/usr/bin/bwrap";

/// Absolute, hardcoded path to the prebuilt, architecture-specific
/// syscall-filter helper (its own generation is out of scope here; this
/// crate only produces the argv it is invoked with).
pub const HOST_B_SYSCALL_FILTER_HELPER_PATH: &str = "/usr/libexec/sandbox-syscall-filter";

/// Loader search paths every process needs to start, regardless of
/// configuration, under `AllowOnly` read mode.
const HOST_B_MANDATED_READ_MINIMUM: &[&str] = &[
    "/usr/lib/**",
    "/usr/bin/**",
    "/bin/**",
    "/lib/**",
    "/lib64/**",
    "/etc/**",
];

/// The two loopback ports a Host-B plan must stay reachable from, however
/// the rest of the network is otherwise restricted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkParams {
    pub http_proxy_port: Option<u16>,
    pub socks_proxy_port: Option<u16>,
}

/// A compiled Host-B launch plan: the bubblewrap argv, the argv the
/// syscall-filter helper is invoked with, and any extra environment the
/// Orchestrator's own env emission doesn't already cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBPlan {
    /// Bubblewrap flags, not including the trailing `--` that separates
    /// them from the helper invocation.
    pub bwrap_argv: Vec<String>,
    /// Argv passed to the syscall-filter helper before it `execve`s into
    /// the user command: the allowed Unix-socket paths it should permit,
    /// prefixed with `--best-effort` when
    /// `enable_weaker_nested_sandbox` asked for non-fatal filter-install
    /// failures.
    pub syscall_filter_argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// `true` when user-namespace creation and the syscall filter were
    /// made best-effort rather than mandatory.
    pub weaker_nested_sandbox: bool,
}

impl HostBPlan {
    /// Renders the full launcher argv (excluding `bwrap` itself): bwrap
    /// flags, `--`, the syscall-filter helper and its argv, `--`, then the
    /// user command. bwrap execs the helper, which installs its filter and
    /// execs the user command in turn.
    pub fn launcher_args(&self, command: &[String]) -> Vec<String> {
        let mut args = self.bwrap_argv.clone();
        args.push("--".to_string());
        args.push(HOST_B_SYSCALL_FILTER_HELPER_PATH.to_string());
        args.extend(self.syscall_filter_argv.iter().cloned());
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

/// Compiles a `Configuration` into a Host-B launch plan. `fs_root` is the
/// filesystem root glob patterns are expanded against (always `/` in
/// production; parameterized for tests so they can use a `TempDir`
/// surrogate root instead of touching the real filesystem).
pub fn compile_host_b(
    config: &Configuration,
    cwd: &Path,
    fs_root: &Path,
    network: &NetworkParams,
) -> Result<HostBPlan, CompileError> {
    let mut bwrap_argv = vec!["--new-session".to_string(), "--die-with-parent".to_string()];
    bwrap_argv.extend(filesystem_args(config, fs_root)?);

    // A new network namespace is not actually unshared: the proxies bind
    // loopback, so keeping the host network namespace avoids bridging a
    // fresh namespace's loopback. Egress is instead narrowed by the
    // syscall-filter helper's address-family restriction.
    if !config.enable_weaker_nested_sandbox {
        bwrap_argv.push("--unshare-pid".to_string());
    }
    bwrap_argv.push("--proc".to_string());
    bwrap_argv.push("/proc".to_string());
    bwrap_argv.push("--dev".to_string());
    bwrap_argv.push("/dev".to_string());
    bwrap_argv.push("--ro-bind".to_string());
    bwrap_argv.push("/sys".to_string());
    bwrap_argv.push("/sys".to_string());
    bwrap_argv.push("--tmpfs".to_string());
    bwrap_argv.push("/tmp".to_string());
    bwrap_argv.push("--dir".to_string());
    bwrap_argv.push("/tmp/claude".to_string());

    if cwd.exists() {
        bwrap_argv.push("--chdir".to_string());
        bwrap_argv.push(path_to_string(cwd));
    }

    let mut syscall_filter_argv = Vec::new();
    if config.enable_weaker_nested_sandbox {
        syscall_filter_argv.push("--best-effort".to_string());
    }
    syscall_filter_argv.push("--proxy-port".to_string());
    for port in [network.http_proxy_port, network.socks_proxy_port]
        .into_iter()
        .flatten()
    {
        syscall_filter_argv.push(port.to_string());
    }
    syscall_filter_argv.extend(config.network.allowed_unix_sockets.iter().cloned());

    Ok(HostBPlan {
        bwrap_argv,
        syscall_filter_argv,
        env: Vec::new(),
        weaker_nested_sandbox: config.enable_weaker_nested_sandbox,
    })
}

/// Builds the bind-mount portion of the bwrap argv. Mount order matters:
/// under `DenyOnly`, the whole root is read-only and `deny_read` subpaths
/// are individually hidden; under `AllowOnly`, the root is never bound at
/// all and only the effective read set is bound, so anything not named is
/// simply absent rather than merely unreadable underneath a broader bind.
fn filesystem_args(config: &Configuration, fs_root: &Path) -> Result<Vec<String>, GlobError> {
    let mut args = Vec::new();

    match config.filesystem.read_policy {
        ReadPolicy::DenyOnly => {
            args.push("--ro-bind".to_string());
            args.push(path_to_string(fs_root));
            args.push("/".to_string());

            let deny_read = compile_for_host_b(&config.filesystem.deny_read, fs_root)?;
            for path in dedup_sorted(deny_read) {
                push_hide(&mut args, &path);
            }
        }
        ReadPolicy::AllowOnly => {
            let mut allow_read = config.filesystem.allow_read.clone();
            allow_read.extend(HOST_B_MANDATED_READ_MINIMUM.iter().map(ToString::to_string));
            let mut effective = compile_for_host_b(&allow_read, fs_root)?;

            let deny_within: BTreeSet<PathBuf> =
                compile_for_host_b(&config.filesystem.deny_within_allow_read, fs_root)?
                    .into_iter()
                    .collect();
            effective.retain(|path| !deny_within.contains(path));

            for path in dedup_sorted(effective) {
                args.push("--ro-bind".to_string());
                args.push(path_to_string(&path));
                args.push(path_to_string(&path));
            }
        }
    }

    let allow_write = dedup_sorted(compile_for_host_b(&config.filesystem.allow_write, fs_root)?);
    for path in &allow_write {
        args.push("--bind".to_string());
        args.push(path_to_string(path));
        args.push(path_to_string(path));
    }
    for git_dir in git_carve_outs(&allow_write) {
        push_hide(&mut args, &git_dir);
    }

    let mut deny_patterns = config.filesystem.deny_within_allow_write.clone();
    deny_patterns.extend(config.filesystem.deny_write.iter().cloned());
    let deny_write = compile_for_host_b(&deny_patterns, fs_root)?;
    for path in dedup_sorted(deny_write) {
        push_hide(&mut args, &path);
    }

    args.push("--dev-bind".to_string());
    args.push("/dev/null".to_string());
    args.push("/dev/null".to_string());

    Ok(args)
}

/// Binds `/dev/null` over `path`, hiding it even though a broader bind
/// underneath still grants access to its parent.
fn push_hide(args: &mut Vec<String>, path: &Path) {
    args.push("--ro-bind".to_string());
    args.push("/dev/null".to_string());
    args.push(path_to_string(path));
}

/// Finds every `.git` directory nested under a writable root, so it can be
/// re-hidden with `push_hide` even though its parent is bound read-write.
/// Follows symlinks while walking (a symlinked `.git` is still a decoy
/// worth neutralizing) but binds `/dev/null` over the entry's own path
/// rather than whatever it resolves to, so a symlink planted at that name
/// is neutralized in place instead of quietly granting write access to its
/// target.
fn git_carve_outs(write_roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();
    for root in write_roots {
        if !root.is_dir() {
            continue;
        }
        for entry in walkdir::WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.file_name() == ".git" {
                found.insert(entry.path().to_path_buf());
            }
        }
    }
    found.into_iter().collect()
}

fn dedup_sorted(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let set: BTreeSet<PathBuf> = paths.into_iter().collect();
    set.into_iter().collect()
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sandbox_policy::FilesystemConfig;
    use sandbox_policy::NetworkConfig;
    use std::fs;
    use tempfile::TempDir;

    fn config_with(filesystem: FilesystemConfig, network: NetworkConfig) -> Configuration {
        Configuration {
            network,
            filesystem,
            ..Configuration::default()
        }
    }

    #[test]
    fn deny_only_binds_root_and_hides_denied_subpaths() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("secret.txt"), b"hi").expect("write");

        let config = config_with(
            FilesystemConfig {
                read_policy: ReadPolicy::DenyOnly,
                deny_read: vec!["/secret.txt".to_string()],
                ..FilesystemConfig::default()
            },
            NetworkConfig::default(),
        );
        let plan = compile_host_b(&config, Path::new("/"), dir.path(), &NetworkParams::default())
            .expect("compiles");

        let root_bind_pos = plan
            .bwrap_argv
            .windows(3)
            .position(|w| w[0] == "--ro-bind" && w[2] == "/")
            .expect("root bind present");
        let hide_pos = plan
            .bwrap_argv
            .iter()
            .position(|arg| arg.ends_with("secret.txt"))
            .expect("hidden path present");
        assert!(root_bind_pos < hide_pos);
    }

    #[test]
    fn allow_only_never_binds_root_and_binds_each_effective_path() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("ok.txt"), b"hi").expect("write");

        let config = config_with(
            FilesystemConfig {
                read_policy: ReadPolicy::AllowOnly,
                allow_read: vec!["/ok.txt".to_string()],
                ..FilesystemConfig::default()
            },
            NetworkConfig::default(),
        );
        let plan = compile_host_b(&config, Path::new("/"), dir.path(), &NetworkParams::default())
            .expect("compiles");

        assert!(
            !plan
                .bwrap_argv
                .windows(3)
                .any(|w| w[0] == "--ro-bind" && w[1] == "/" && w[2] == "/")
        );
        assert!(plan.bwrap_argv.iter().any(|arg| arg.ends_with("ok.txt")));
    }

    #[test]
    fn allow_write_paths_are_rebound_read_write() {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("work")).expect("mkdir");

        let config = config_with(
            FilesystemConfig {
                allow_write: vec!["/work".to_string()],
                ..FilesystemConfig::default()
            },
            NetworkConfig::default(),
        );
        let plan = compile_host_b(&config, Path::new("/"), dir.path(), &NetworkParams::default())
            .expect("compiles");

        assert!(
            plan.bwrap_argv
                .windows(3)
                .any(|w| w[0] == "--bind" && w[1].ends_with("work"))
        );
    }

    #[test]
    fn git_directory_under_a_writable_root_stays_hidden() {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("work/.git")).expect("mkdir");
        fs::write(dir.path().join("work/.git/HEAD"), b"ref: refs/heads/main").expect("write");

        let config = config_with(
            FilesystemConfig {
                allow_write: vec!["/work".to_string()],
                ..FilesystemConfig::default()
            },
            NetworkConfig::default(),
        );
        let plan = compile_host_b(&config, Path::new("/"), dir.path(), &NetworkParams::default())
            .expect("compiles");

        let write_bind_pos = plan
            .bwrap_argv
            .windows(3)
            .position(|w| w[0] == "--bind" && w[1].ends_with("work"))
            .expect("write bind present");
        let git_hide_pos = plan
            .bwrap_argv
            .windows(3)
            .position(|w| w[0] == "--ro-bind" && w[1] == "/dev/null" && w[2].ends_with(".git"))
            .expect("git carve-out present");
        assert!(write_bind_pos < git_hide_pos);
    }

    #[test]
    fn weaker_nested_sandbox_skips_unshare_pid_and_marks_filter_best_effort() {
        let config = config_with(
            FilesystemConfig::default(),
            NetworkConfig::default(),
        );
        let mut config = config;
        config.enable_weaker_nested_sandbox = true;
        let plan = compile_host_b(&config, Path::new("/"), Path::new("/"), &NetworkParams::default())
            .expect("compiles");

        assert!(!plan.bwrap_argv.iter().any(|arg| arg == "--unshare-pid"));
        assert_eq!(plan.syscall_filter_argv.first().map(String::as_str), Some("--best-effort"));
        assert!(plan.weaker_nested_sandbox);
    }

    #[test]
    fn launcher_args_wraps_helper_then_command() {
        let config = config_with(FilesystemConfig::default(), NetworkConfig::default());
        let plan = compile_host_b(&config, Path::new("/"), Path::new("/"), &NetworkParams::default())
            .expect("compiles");
        let args = plan.launcher_args(&["echo".to_string(), "hi".to_string()]);
        assert_eq!(args.last(), Some(&"hi".to_string()));
        assert!(
            args.iter()
                .any(|arg| arg == HOST_B_SYSCALL_FILTER_HELPER_PATH)
        );
    }

    #[test]
    fn network_params_are_forwarded_to_syscall_filter_argv() {
        let config = config_with(FilesystemConfig::default(), NetworkConfig::default());
        let network = NetworkParams {
            http_proxy_port: Some(8080),
            socks_proxy_port: Some(1080),
        };
        let plan = compile_host_b(&config, Path::new("/"), Path::new("/"), &network).expect("compiles");
        assert!(plan.syscall_filter_argv.contains(&"8080".to_string()));
        assert!(plan.syscall_filter_argv.contains(&"1080".to_string()));
    }
}
