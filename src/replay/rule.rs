//! Replay rule matching: glob clauses over method/URL, and the correlation
//! extractors recorded against replay failures. Grounded on
//! `original_source/conf.go`'s `ReplayCondition`/`RecordFail` shapes and
//! `gg/pkg/fn.Match`'s case-sensitive glob semantics, adapted to spec §4.5's
//! per-pattern `!`-prefix inversion rather than `conf.go`'s condition-level
//! `Not` flag (see DESIGN.md, OQ-1).

use wildmatch::WildMatch;

/// A set of glob patterns matched against one field (method or URL). A
/// pattern prefixed `!` inverts its own outcome; the clause as a whole
/// matches if any pattern's (possibly inverted) outcome is positive (spec
/// §4.5 step 1) — a literal OR, not a veto. An empty clause (no patterns at
/// all) matches everything.
#[derive(Debug, Clone, Default)]
pub struct MatchClause {
    patterns: Vec<(bool, WildMatch)>,
}

impl MatchClause {
    pub fn new(patterns: Vec<String>) -> Self {
        let patterns = patterns
            .into_iter()
            .map(|p| match p.strip_prefix('!') {
                Some(rest) => (true, WildMatch::new(rest)),
                None => (false, WildMatch::new(&p)),
            })
            .collect();
        MatchClause { patterns }
    }

    /// `matches(!p, s) = not matches(p, s)` (TESTABLE PROPERTY 5); the
    /// clause matches if any pattern's outcome, after that inversion, is
    /// `true`.
    pub fn matches(&self, value: &str) -> bool {
        self.patterns.is_empty()
            || self
                .patterns
                .iter()
                .any(|(negated, pattern)| pattern.matches(value) != *negated)
    }
}

/// One alternative within a rule: matches when both the method and URL
/// clauses match (conditions across a rule are OR'd, clauses within a
/// condition are AND'd).
#[derive(Debug, Clone, Default)]
pub struct MatchCondition {
    pub method: MatchClause,
    pub url: MatchClause,
}

impl MatchCondition {
    pub fn matches(&self, method: &str, url: &str) -> bool {
        self.method.matches(method) && self.url.matches(url)
    }
}

/// A field to extract from a request/response body on replay failure, for
/// inclusion in the failure log record.
#[derive(Debug, Clone)]
pub struct CorrelationExtractor {
    /// Name this value is recorded under in the failure record.
    pub key: String,
    /// JSON dotted/bracketed path, or an XPath expression (spec §4.5).
    pub path: String,
}

/// One configured replay target: where to fan requests out to, which
/// requests qualify, and how to record failures.
#[derive(Debug, Clone, Default)]
pub struct ReplayRule {
    pub addrs: Vec<String>,
    pub conditions: Vec<MatchCondition>,
    pub extractors: Vec<CorrelationExtractor>,
    pub fail_log_file: Option<String>,
}

impl ReplayRule {
    /// A rule with no conditions at all matches every request (spec §4.5).
    pub fn matches(&self, method: &str, url: &str) -> bool {
        self.conditions.is_empty() || self.conditions.iter().any(|c| c.matches(method, url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_clause_matches_everything() {
        let clause = MatchClause::new(vec![]);
        assert!(clause.matches("GET"));
        assert!(clause.matches(""));
    }

    #[test]
    fn positive_glob_matches() {
        let clause = MatchClause::new(vec!["/api/*".to_owned()]);
        assert!(clause.matches("/api/users"));
        assert!(!clause.matches("/health"));
    }

    #[test]
    fn single_negated_pattern_excludes_only_its_own_match() {
        // spec §4.5 end-to-end scenario 4: `!OPTIONS` against OPTIONS does
        // not match; against anything else it does.
        let clause = MatchClause::new(vec!["!OPTIONS".to_owned()]);
        assert!(!clause.matches("OPTIONS"));
        assert!(clause.matches("GET"));
    }

    #[test]
    fn mixed_clause_is_a_literal_or_of_inverted_outcomes() {
        // spec §4.5 step 1 defines the clause as matching when ANY
        // pattern's (possibly inverted) outcome is positive, not "positive
        // unless vetoed by a negative pattern".
        let clause = MatchClause::new(vec!["GET".to_owned(), "!POST".to_owned()]);
        assert!(clause.matches("GET")); // "GET" matches directly
        assert!(clause.matches("PUT")); // "!POST" inverts a non-match into true
        assert!(!clause.matches("POST")); // "GET" false, "!POST" false: no positive outcome
    }

    #[test]
    fn glob_matching_is_case_sensitive() {
        let clause = MatchClause::new(vec!["GET".to_owned()]);
        assert!(clause.matches("GET"));
        assert!(!clause.matches("get"));
    }

    #[test]
    fn rule_with_no_conditions_matches_everything() {
        let rule = ReplayRule {
            addrs: vec!["http://localhost:9000".to_owned()],
            ..Default::default()
        };
        assert!(rule.matches("DELETE", "/anything"));
    }

    #[test]
    fn conditions_are_ored_clauses_are_anded() {
        let rule = ReplayRule {
            conditions: vec![MatchCondition {
                method: MatchClause::new(vec!["POST".to_owned()]),
                url: MatchClause::new(vec!["/orders".to_owned()]),
            }],
            ..Default::default()
        };
        assert!(rule.matches("POST", "/orders"));
        assert!(!rule.matches("GET", "/orders"));
        assert!(!rule.matches("POST", "/users"));
    }
}
