//! Adapter from `sandbox_policy::HostMatcher` to the per-connection
//! decisions both proxies need, recording denials in the Violation Store.

use std::sync::Arc;
use std::sync::Mutex;

use sandbox_policy::Decision;
use sandbox_policy::HostMatcher;

use crate::reasons::REASON_NOT_ALLOWED;
use crate::violation_store::NewViolation;
use crate::violation_store::ViolationKind;
use crate::violation_store::ViolationStore;

/// Context threaded through a single sandboxed execution, identifying which
/// violation stream a denial belongs to and how it should be encoded.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: Option<u64>,
    pub encoded_command: String,
}

/// The proxies are long-lived (bound once at `initialize`) but each
/// `wrap_with_sandbox` call starts a new execution with its own id and
/// command hash, so the context a running accept loop attributes denials to
/// has to be swappable after the fact rather than fixed at construction.
#[derive(Clone)]
pub struct HostEvaluator {
    matcher: Arc<HostMatcher>,
    /// Matches `Configuration::ignore_violations.network` patterns;
    /// `None` when the list is empty, so the common case skips a matcher
    /// lookup entirely.
    ignore_matcher: Option<Arc<HostMatcher>>,
    violations: ViolationStore,
    context: Arc<Mutex<ExecutionContext>>,
}

impl HostEvaluator {
    pub fn new(matcher: Arc<HostMatcher>, violations: ViolationStore, context: ExecutionContext) -> Self {
        Self::with_ignore_matcher(matcher, None, violations, context)
    }

    pub fn with_ignore_matcher(
        matcher: Arc<HostMatcher>,
        ignore_matcher: Option<Arc<HostMatcher>>,
        violations: ViolationStore,
        context: ExecutionContext,
    ) -> Self {
        Self {
            matcher,
            ignore_matcher,
            violations,
            context: Arc::new(Mutex::new(context)),
        }
    }

    /// Replaces the execution context every clone of this evaluator shares,
    /// so subsequent connections get attributed to the new execution.
    pub fn set_context(&self, context: ExecutionContext) {
        *self.context.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = context;
    }

    /// Evaluates `host:port`, recording a `Network` violation when the
    /// result is a deny. Returns `true` when the destination is allowed.
    pub fn allow(&self, host: &str, port: u16) -> bool {
        let normalized = sandbox_policy::normalize_host(host);
        match self.matcher.evaluate(&normalized, port) {
            Decision::Allow => true,
            Decision::Deny => {
                let context = self
                    .context
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                let suppressed = self
                    .ignore_matcher
                    .as_ref()
                    .is_some_and(|ignore| matches!(ignore.evaluate(&normalized, port), Decision::Allow));
                self.violations.add(NewViolation {
                    execution_id: context.execution_id,
                    kind: ViolationKind::Network,
                    subject: format!("{normalized}:{port}"),
                    pid: None,
                    raw: REASON_NOT_ALLOWED.to_string(),
                    encoded_command: context.encoded_command,
                    suppressed,
                });
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator(allowed: &[&str], denied: &[&str]) -> (HostEvaluator, ViolationStore) {
        let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
        let denied: Vec<String> = denied.iter().map(|s| s.to_string()).collect();
        let matcher = HostMatcher::compile(&allowed, &denied).expect("compiles");
        let violations = ViolationStore::new();
        let evaluator = HostEvaluator::new(
            Arc::new(matcher),
            violations.clone(),
            ExecutionContext {
                execution_id: Some(1),
                encoded_command: "hash".to_string(),
            },
        );
        (evaluator, violations)
    }

    #[test]
    fn allowed_host_passes_without_recording_a_violation() {
        let (evaluator, violations) = evaluator(&["*.example.com"], &[]);
        assert!(evaluator.allow("api.example.com", 443));
        assert_eq!(violations.total_count(), 0);
    }

    #[test]
    fn denied_host_is_rejected_and_recorded() {
        let (evaluator, violations) = evaluator(&[], &["*"]);
        assert!(!evaluator.allow("evil.example.com", 443));
        assert_eq!(violations.total_count(), 1);
        let event = &violations.snapshot()[0];
        assert_eq!(event.subject, "evil.example.com:443");
    }
}
