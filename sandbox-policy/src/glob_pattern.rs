//! Gitignore-style path glob compilation.
//!
//! One compiled pattern set can be rendered two ways: as an anchored regex
//! for Host-A's profile interpreter, or as a list of canonical, currently
//! existing paths for Host-B's bind-mount plan.

use std::path::Path;
use std::path::PathBuf;

use globset::GlobBuilder;

/// A pattern that could not be compiled, with the reason it was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid glob pattern `{pattern}`: {reason}")]
pub struct GlobError {
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CompiledGlob {
    raw: String,
    /// Anchored to the filesystem root rather than matchable at any depth.
    anchored: bool,
    /// Constrains the match to directories.
    dir_only: bool,
    /// A `!`-prefixed pattern is a deny-override within its pattern set.
    negated: bool,
    matcher: globset::GlobMatcher,
}

impl CompiledGlob {
    pub fn is_negated(&self) -> bool {
        self.negated
    }

    pub fn is_dir_only(&self) -> bool {
        self.dir_only
    }

    /// Renders an anchored regular expression suitable for Host-A's
    /// regex-based path matching. `**` becomes "any sequence including
    /// separators", `*` is confined to one path segment, `?` matches one
    /// non-separator character.
    pub fn to_host_a_regex(&self) -> String {
        let body = translate_to_regex(strip_markers(&self.raw));
        let anchored_body = if self.anchored {
            format!("^{body}")
        } else {
            format!("^(?:.*/)?{body}")
        };
        if self.dir_only {
            format!("{anchored_body}(?:/.*)?$")
        } else {
            format!("{anchored_body}$")
        }
    }

    fn matches_path(&self, relative: &Path) -> bool {
        self.matcher.is_match(relative)
    }
}

/// Compiles a full pattern list without rendering it to either host's sink,
/// for callers (the Violation Pipeline's `ignore_violations.filesystem`
/// check) that only need membership testing against a subject path.
pub fn compile_all(patterns: &[String]) -> Result<Vec<CompiledGlob>, GlobError> {
    patterns.iter().map(|raw| compile(raw)).collect()
}

/// Tests an absolute filesystem path against a pattern set compiled by
/// [`compile_all`], honoring negation overrides in input order the same way
/// `compile_for_host_b` does. Used to decide whether a recorded violation's
/// subject matches `ignore_violations.filesystem`.
pub fn matches_any(patterns: &[CompiledGlob], subject_path: &Path) -> bool {
    let relative = subject_path.strip_prefix("/").unwrap_or(subject_path);
    patterns
        .iter()
        .rev()
        .find(|glob| glob.matches_path(relative))
        .map(|glob| !glob.is_negated())
        .unwrap_or(false)
}

/// Rejects inexpressible patterns at compile time rather than silently
/// dropping them.
fn reject_ambiguous(pattern: &str) -> Result<(), String> {
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while let Some(pos) = pattern[i..].find("**") {
        let start = i + pos;
        let end = start + 2;
        let preceded_ok = start == 0 || bytes[start - 1] == b'/';
        let followed_ok = end == bytes.len() || bytes[end] == b'/';
        if !preceded_ok || !followed_ok {
            return Err(format!(
                "`**` at byte {start} must be bounded by `/` or the start/end of the pattern"
            ));
        }
        i = end;
    }
    Ok(())
}

/// Rejects patterns that would walk above the filesystem root via a `..`
/// path segment, distinct from a pattern that simply matches nothing:
/// `../../etc/passwd` must fail to compile rather than silently expand to
/// zero matches the way an innocuous nonexistent path does.
fn reject_escaping(glob_body: &str) -> Result<(), String> {
    if glob_body.trim_start_matches('/').split('/').any(|segment| segment == "..") {
        return Err("pattern escapes the filesystem root via `..`".to_string());
    }
    Ok(())
}

fn strip_markers(raw: &str) -> &str {
    let raw = raw.strip_prefix('!').unwrap_or(raw);
    raw.strip_suffix('/').unwrap_or(raw)
}

/// Translates gitignore glob syntax into a regex body (unanchored,
/// unescaped outside of literal characters). Not a general-purpose glob
/// translator: it only needs to support the constructs used in practice
/// by filesystem allow/deny lists.
fn translate_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let chars: Vec<char> = pattern.trim_start_matches('/').chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                out.push_str(".*");
                i += 2;
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            '[' => {
                // Character class: copy through verbatim up to the closing `]`.
                out.push('[');
                i += 1;
                while i < chars.len() && chars[i] != ']' {
                    out.push(chars[i]);
                    i += 1;
                }
                if i < chars.len() {
                    out.push(']');
                    i += 1;
                }
            }
            c if "\\.+(){}|^$".contains(c) => {
                out.push('\\');
                out.push(c);
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Compiles a single gitignore-style pattern, validating it eagerly.
pub fn compile(raw: &str) -> Result<CompiledGlob, GlobError> {
    let err = |reason: String| GlobError {
        pattern: raw.to_string(),
        reason,
    };

    let negated = raw.starts_with('!');
    let body = raw.strip_prefix('!').unwrap_or(raw);
    let anchored = body.starts_with('/');
    let dir_only = body.ends_with('/') && body.len() > 1;
    let glob_body = strip_markers(raw);

    reject_ambiguous(glob_body).map_err(err)?;
    reject_escaping(glob_body).map_err(err)?;

    let glob_source = if anchored {
        glob_body.trim_start_matches('/').to_string()
    } else {
        format!("**/{}", glob_body.trim_start_matches('/'))
    };

    let matcher = GlobBuilder::new(&glob_source)
        .literal_separator(true)
        .build()
        .map_err(|e| err(e.to_string()))?
        .compile_matcher();

    Ok(CompiledGlob {
        raw: raw.to_string(),
        anchored,
        dir_only,
        negated,
        matcher,
    })
}

/// Compiles a full pattern list for the Host-A (regex) sink, returning one
/// anchored regex per non-negated pattern and a separate list for negated
/// (deny-override) patterns, in input order.
pub fn compile_for_host_a(
    patterns: &[String],
) -> Result<(Vec<String>, Vec<String>), GlobError> {
    let mut allow = Vec::new();
    let mut deny_override = Vec::new();
    for raw in patterns {
        let compiled = compile(raw)?;
        let regex = compiled.to_host_a_regex();
        if compiled.is_negated() {
            deny_override.push(regex);
        } else {
            allow.push(regex);
        }
    }
    Ok((allow, deny_override))
}

/// Expands a pattern list against a filesystem root for the Host-B
/// (bind-mount) sink: walks `root` once, lazily, and returns the canonical
/// paths of every currently existing match. Non-existing paths (whether
/// literal or produced by a glob with no current matches) are silently
/// skipped; a pattern that would escape `root` via a `..` segment is
/// instead rejected at compile time by `compile`, since that case is not
/// merely nonexistent, it is inexpressible as a root-relative bind target.
pub fn compile_for_host_b(
    patterns: &[String],
    root: &Path,
) -> Result<Vec<PathBuf>, GlobError> {
    let mut compiled = Vec::with_capacity(patterns.len());
    for raw in patterns {
        compiled.push(compile(raw)?);
    }

    let mut matches = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
    {
        let relative = match entry.path().strip_prefix(root) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let is_negated_match = compiled
            .iter()
            .rev()
            .find(|glob| glob.matches_path(relative))
            .map(CompiledGlob::is_negated)
            .unwrap_or(true);
        if is_negated_match {
            continue;
        }
        if let Ok(canonical) = entry.path().canonicalize() {
            matches.push(canonical);
        }
    }
    matches.sort();
    matches.dedup();
    Ok(matches)
}
