//! Host-A audit-stream line parser: tolerates malformed lines rather than
//! failing the whole stream, and extracts `pid`, `subject`, `kind` while
//! preserving the original `raw` line for diagnostics.

use sandbox_proxy::ViolationKind;

/// Caps a single audit line's length before parsing, so an adversarial or
/// corrupted audit stream can't force an unbounded allocation. Lines
/// longer than this are treated as malformed.
const MAX_LINE_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedViolation {
    pub pid: Option<u32>,
    pub kind: ViolationKind,
    pub subject: String,
    pub raw: String,
}

/// Parses one line of the Host-A audit stream. Returns `None` for lines
/// that don't match the expected shape (unknown lines are skipped; they
/// are not an error) or are too long to be a legitimate line (adversarial
/// input is also skipped, never panics).
///
/// Expected shape: `... Sandbox: <process>(<pid>) deny(<n>) <operation>
/// <subject>`. `operation` determines `kind`: `file-read*` → `FsRead`,
/// `file-write*` → `FsWrite`, `network*` → `Network`, anything else →
/// `Other`.
pub fn parse_audit_a_line(line: &str) -> Option<ParsedViolation> {
    if line.len() > MAX_LINE_LEN || !line.is_ascii() {
        return None;
    }
    let marker_pos = line.find("Sandbox:")?;
    let rest = line[marker_pos + "Sandbox:".len()..].trim_start();

    let paren_open = rest.find('(')?;
    let paren_close = rest[paren_open..].find(')').map(|i| paren_open + i)?;
    let pid = rest[paren_open + 1..paren_close].trim().parse::<u32>().ok();

    let after_pid = rest[paren_close + 1..].trim_start();
    let mut fields = after_pid.splitn(3, char::is_whitespace);
    let decision = fields.next()?;
    if !decision.starts_with("deny") {
        return None;
    }
    let operation = fields.next()?;
    let subject = fields.next()?.trim();
    if subject.is_empty() {
        return None;
    }

    Some(ParsedViolation {
        pid,
        kind: classify_operation(operation),
        subject: subject.to_string(),
        raw: line.to_string(),
    })
}

fn classify_operation(operation: &str) -> ViolationKind {
    if operation.starts_with("file-read") {
        ViolationKind::FsRead
    } else if operation.starts_with("file-write") {
        ViolationKind::FsWrite
    } else if operation.starts_with("network") {
        ViolationKind::Network
    } else {
        ViolationKind::Other
    }
}

/// Feeds a full audit stream (one line at a time) into a sink closure,
/// counting lines that don't parse rather than surfacing them as errors —
/// a single malformed line must never terminate ingest. Returns the number
/// of lines that did not parse.
pub fn ingest_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
    mut sink: impl FnMut(ParsedViolation),
) -> u64 {
    let mut malformed = 0u64;
    for line in lines {
        match parse_audit_a_line(line) {
            Some(violation) => sink(violation),
            None => {
                if !line.trim().is_empty() {
                    tracing::trace!(line_len = line.len(), "audit_a: unparsed line skipped");
                }
                malformed += 1;
            }
        }
    }
    malformed
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_a_well_formed_deny_line() {
        let line = "Jul 27 10:00:00 host kernel[0]: Sandbox: mytool(1234) deny(1) file-read-data /etc/shadow";
        let parsed = parse_audit_a_line(line).expect("parses");
        assert_eq!(parsed.pid, Some(1234));
        assert_eq!(parsed.kind, ViolationKind::FsRead);
        assert_eq!(parsed.subject, "/etc/shadow");
        assert_eq!(parsed.raw, line);
    }

    #[test]
    fn classifies_network_and_write_operations() {
        let write = parse_audit_a_line("Sandbox: tool(1) deny(1) file-write-data /tmp/x").unwrap();
        assert_eq!(write.kind, ViolationKind::FsWrite);

        let network =
            parse_audit_a_line("Sandbox: tool(1) deny(1) network-outbound 10.0.0.1:443").unwrap();
        assert_eq!(network.kind, ViolationKind::Network);
    }

    #[test]
    fn unknown_operation_classifies_as_other() {
        let parsed = parse_audit_a_line("Sandbox: tool(1) deny(1) process-info-dump self").unwrap();
        assert_eq!(parsed.kind, ViolationKind::Other);
    }

    #[test]
    fn unrelated_lines_are_skipped_not_errors() {
        assert!(parse_audit_a_line("this is not an audit line at all").is_none());
        assert!(parse_audit_a_line("").is_none());
    }

    #[test]
    fn allow_decisions_are_not_recorded_as_violations() {
        assert!(parse_audit_a_line("Sandbox: tool(1) allow(0) file-read-data /etc/hosts").is_none());
    }

    #[test]
    fn oversized_line_is_treated_as_malformed() {
        let huge = format!(
            "Sandbox: tool(1) deny(1) file-read-data {}",
            "a".repeat(MAX_LINE_LEN)
        );
        assert!(parse_audit_a_line(&huge).is_none());
    }

    #[test]
    fn ingest_lines_counts_malformed_without_stopping() {
        let lines = vec![
            "Sandbox: tool(1) deny(1) file-read-data /etc/shadow",
            "garbage line",
            "Sandbox: tool(2) deny(1) network-outbound 10.0.0.1:443",
        ];
        let mut seen = Vec::new();
        let malformed = ingest_lines(lines.into_iter(), |violation| seen.push(violation));
        assert_eq!(malformed, 1);
        assert_eq!(seen.len(), 2);
    }
}
