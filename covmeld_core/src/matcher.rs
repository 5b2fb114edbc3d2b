use std::path::Path;

/// Decides whether a testcase's execution output matches a bug of interest.
///
/// Triage drivers live outside this crate; they supply the testcase path and
/// the captured stdout/stderr of the run. The two variants below are selected
/// at configuration time, never loaded dynamically.
pub trait BugMatcher: Send + Sync {
    fn matches(&self, testcase: &Path, stdout: &str, stderr: &str) -> bool;
}

/// Matches when any configured pattern occurs in stdout or stderr.
#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    patterns: Vec<String>,
}

impl PatternMatcher {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }
}

impl BugMatcher for PatternMatcher {
    fn matches(&self, _testcase: &Path, stdout: &str, stderr: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| stdout.contains(p) || stderr.contains(p))
    }
}

/// Delegates the decision to a caller-supplied function.
pub struct CallbackMatcher<F>
where
    F: Fn(&Path, &str, &str) -> bool + Send + Sync,
{
    callback: F,
}

impl<F> CallbackMatcher<F>
where
    F: Fn(&Path, &str, &str) -> bool + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> BugMatcher for CallbackMatcher<F>
where
    F: Fn(&Path, &str, &str) -> bool + Send + Sync,
{
    fn matches(&self, testcase: &Path, stdout: &str, stderr: &str) -> bool {
        (self.callback)(testcase, stdout, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn pattern_matcher_scans_both_streams() {
        let matcher = PatternMatcher::new(vec![
            "AddressSanitizer".to_string(),
            "panicked at".to_string(),
        ]);
        let testcase = PathBuf::from("id:000000");

        assert!(matcher.matches(&testcase, "", "ERROR: AddressSanitizer: heap-buffer-overflow"));
        assert!(matcher.matches(&testcase, "thread panicked at 'boom'", ""));
        assert!(!matcher.matches(&testcase, "all good", "clean exit"));
    }

    #[test]
    fn empty_pattern_matcher_never_matches() {
        let matcher = PatternMatcher::default();
        assert!(!matcher.matches(Path::new("x"), "anything", "at all"));
    }

    #[test]
    fn callback_matcher_delegates() {
        let matcher = CallbackMatcher::new(|testcase: &Path, _stdout: &str, stderr: &str| {
            testcase.to_string_lossy().starts_with("id:") && stderr.contains("SIGSEGV")
        });
        assert!(matcher.matches(Path::new("id:000001"), "", "got SIGSEGV"));
        assert!(!matcher.matches(Path::new("seed"), "", "got SIGSEGV"));
    }

    #[test]
    fn matchers_are_usable_as_trait_objects() {
        let matchers: Vec<Box<dyn BugMatcher>> = vec![
            Box::new(PatternMatcher::new(vec!["abort".to_string()])),
            Box::new(CallbackMatcher::new(|_: &Path, _: &str, _: &str| false)),
        ];
        let hits = matchers
            .iter()
            .filter(|m| m.matches(Path::new("t"), "", "abort()"))
            .count();
        assert_eq!(hits, 1);
    }
}
