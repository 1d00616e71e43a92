//! Certainty analysis — decides how confidently a task can be executed.
//!
//! A pure, deterministic function from task text to a score in `[0, 1]`.
//! The dispatcher maps the score to an execution mode: `>= 0.7` run
//! immediately, `[0.4, 0.7)` start the assistant in planning mode, `< 0.4`
//! send clarification questions back instead of executing.
//!
//! The heuristics are intentionally cheap: word counts, imperative action
//! verbs, ambiguity markers, and concrete file references. Voice-captured
//! tasks skew short and vague; the analyzer's job is to keep "maybe fix the
//! thing somehow" from burning an assistant session.

use serde::Serialize;

/// Score bands, aligned with the dispatcher's mode thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertaintyLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertaintyAnalysis {
    pub score: f64,
    pub level: CertaintyLevel,
    pub reasons: Vec<String>,
    pub clarification_questions: Vec<String>,
}

/// Imperative verbs that signal a concrete, executable instruction.
const ACTION_VERBS: [&str; 22] = [
    "add", "fix", "update", "implement", "remove", "delete", "refactor", "rename", "write",
    "create", "change", "test", "document", "upgrade", "bump", "move", "convert", "replace",
    "extract", "migrate", "install", "revert",
];

/// Phrases that signal the speaker was still thinking out loud.
const AMBIGUITY_MARKERS: [&str; 14] = [
    "maybe",
    "might",
    "possibly",
    "somehow",
    "not sure",
    "or something",
    "i think",
    "perhaps",
    "look into",
    "explore",
    "investigate",
    "think about",
    "consider",
    "at some point",
];

/// Analyze task text. Deterministic: the same input always yields the same
/// analysis.
pub fn analyze(content: &str, summary: Option<&str>, transcript: Option<&str>) -> CertaintyAnalysis {
    let combined = {
        let mut s = String::new();
        if let Some(summary) = summary {
            s.push_str(summary);
            s.push(' ');
        }
        s.push_str(content);
        s.to_lowercase()
    };
    let words = combined.split_whitespace().count();

    let mut score: f64 = 0.5;
    let mut reasons = Vec::new();
    let mut questions = Vec::new();

    // Imperative action verb anywhere in the text.
    let has_action = ACTION_VERBS.iter().any(|v| contains_word(&combined, v));
    if has_action {
        score += 0.2;
        reasons.push("contains an actionable verb".to_string());
    } else {
        score -= 0.1;
        reasons.push("no clear action verb".to_string());
        questions.push("What should actually be done — a fix, a new feature, a cleanup?".to_string());
    }

    // Concrete references: paths, extensions, backticked identifiers.
    let has_reference = combined.contains('/')
        || combined.contains('`')
        || combined
            .split_whitespace()
            .any(|w| w.contains('.') && !w.ends_with('.'));
    if has_reference {
        score += 0.15;
        reasons.push("references a concrete file or identifier".to_string());
    } else {
        questions.push("Which file, module, or component does this apply to?".to_string());
    }

    // Ambiguity markers, each one eroding confidence.
    let markers: Vec<&str> = AMBIGUITY_MARKERS
        .iter()
        .copied()
        .filter(|m| combined.contains(m))
        .collect();
    if !markers.is_empty() {
        let penalty = (0.15 * markers.len() as f64).min(0.3);
        score -= penalty;
        reasons.push(format!("hedging language: {}", markers.join(", ")));
        questions.push("Could you restate this as a definite instruction?".to_string());
    }

    // Unresolved questions in the task itself.
    if combined.contains('?') {
        score -= 0.15;
        reasons.push("task text contains open questions".to_string());
        questions.push("The task asks a question — what answer should be assumed?".to_string());
    }

    // Length. Very short tasks rarely carry enough context to act on;
    // moderate length is the sweet spot.
    if words < 4 {
        score -= 0.15;
        reasons.push("very short task text".to_string());
        questions.push("Can you describe the task in a full sentence or two?".to_string());
    } else if words >= 8 {
        score += 0.1;
        reasons.push("detailed description".to_string());
    }

    let score = score.clamp(0.0, 1.0);
    let level = if score >= 0.7 {
        CertaintyLevel::High
    } else if score >= 0.4 {
        CertaintyLevel::Medium
    } else {
        CertaintyLevel::Low
    };

    // Transcript presence is informational only — the normalized content is
    // what gets executed.
    let _ = transcript;

    CertaintyAnalysis {
        score,
        level,
        reasons,
        clarification_questions: questions,
    }
}

/// Whole-word containment — "update" should not match "outdated".
fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concrete_instruction_scores_high() {
        let analysis = analyze(
            "Add unit tests for the retry logic in src/retry.rs and fix the timeout edge case",
            Some("Add retry tests"),
            None,
        );
        assert!(analysis.score >= 0.7, "score was {}", analysis.score);
        assert_eq!(analysis.level, CertaintyLevel::High);
        assert!(analysis.clarification_questions.is_empty());
    }

    #[test]
    fn single_hedge_word_scores_low() {
        let analysis = analyze("maybe", None, None);
        assert!(analysis.score < 0.4, "score was {}", analysis.score);
        assert_eq!(analysis.level, CertaintyLevel::Low);
        assert!(!analysis.clarification_questions.is_empty());
    }

    #[test]
    fn hedged_instruction_lands_in_planning_band() {
        let analysis = analyze(
            "maybe update the sync pipeline so it retries failed uploads when the network drops",
            None,
            None,
        );
        assert!(analysis.score >= 0.4 && analysis.score < 0.7, "score was {}", analysis.score);
        assert_eq!(analysis.level, CertaintyLevel::Medium);
    }

    #[test]
    fn analysis_is_deterministic() {
        let a = analyze("fix the login bug in auth.rs", None, None);
        let b = analyze("fix the login bug in auth.rs", None, None);
        assert_eq!(a.score, b.score);
        assert_eq!(a.reasons, b.reasons);
    }

    #[test]
    fn score_stays_in_unit_interval() {
        let vague = analyze("maybe possibly somehow?", None, None);
        assert!(vague.score >= 0.0);
        let confident = analyze(
            "add tests, fix bugs, update docs, refactor src/api/mod.rs, rename the helper, \
             implement the new endpoint and document everything thoroughly",
            Some("big cleanup"),
            None,
        );
        assert!(confident.score <= 1.0);
    }

    #[test]
    fn action_verb_matching_is_whole_word() {
        // "outdated" contains "update" as a substring but is not an instruction.
        assert!(!contains_word("everything is outdated", "update"));
        assert!(contains_word("update the readme", "update"));
    }
}
