//! Post-processing of raw model output into a bare correction.
//!
//! Small models wrap answers in code fences, polite preambles, quoted spans
//! and trailing change logs. The pipeline is an ordered list of rules, each a
//! pattern plus the action taken on a match, applied to the trimmed response.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

/// Output longer than this multiple of the input is treated as an explanation
/// wrapped around a quoted answer.
pub const VERBOSE_RATIO: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupAction {
    /// Delete every match.
    Remove,
    /// Replace the whole text by a capture group when it matches, unless the
    /// input itself opened with a quote.
    UnwrapUnlessInputQuoted(usize),
    /// Replace the whole text by a capture group when the output is more than
    /// `ratio` times longer than the input.
    ExtractWhenVerbose { group: usize, ratio: usize },
    /// Drop everything from the start of the first match.
    TruncateAtMatch,
}

#[derive(Debug)]
pub struct CleanupRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub action: CleanupAction,
}

impl CleanupRule {
    /// Compiles `pattern`; an invalid one is logged and the rule dropped.
    pub fn new(name: &'static str, pattern: &str, action: CleanupAction) -> Option<Self> {
        match Regex::new(pattern) {
            Ok(pattern) => Some(Self {
                name,
                pattern,
                action,
            }),
            Err(err) => {
                warn!(rule = name, "skipping cleanup rule with invalid pattern: {err}");
                None
            }
        }
    }

    /// Applies this rule to `text`, returning the rewritten text when the rule
    /// fired.
    pub fn apply(&self, text: &str, input: &str) -> Option<String> {
        match self.action {
            CleanupAction::Remove => {
                if !self.pattern.is_match(text) {
                    return None;
                }
                Some(self.pattern.replace_all(text, "").into_owned())
            }
            CleanupAction::UnwrapUnlessInputQuoted(group) => {
                if input.trim_start().starts_with('"') {
                    return None;
                }
                let captures = self.pattern.captures(text)?;
                captures.get(group).map(|inner| inner.as_str().to_string())
            }
            CleanupAction::ExtractWhenVerbose { group, ratio } => {
                if text.chars().count() <= input.chars().count() * ratio {
                    return None;
                }
                let captures = self.pattern.captures(text)?;
                captures.get(group).map(|inner| inner.as_str().to_string())
            }
            CleanupAction::TruncateAtMatch => {
                let found = self.pattern.find(text)?;
                Some(text[..found.start()].to_string())
            }
        }
    }
}

pub struct CleanupPipeline {
    rules: Vec<CleanupRule>,
}

static STANDARD_RULES: LazyLock<CleanupPipeline> = LazyLock::new(|| {
    CleanupPipeline::new([
        CleanupRule::new(
            "fence_open",
            r"(?i)\A```(?:text|markdown)?\n",
            CleanupAction::Remove,
        ),
        CleanupRule::new("fence_close", r"\n```\z", CleanupAction::Remove),
        CleanupRule::new(
            "quoted_answer",
            r#""([^"]+)""#,
            CleanupAction::ExtractWhenVerbose {
                group: 1,
                ratio: VERBOSE_RATIO,
            },
        ),
        CleanupRule::new(
            "announced_preamble",
            r"(?i)\A(?:sure,\s*)?(?:here is|here's)\s+(?:the|your)\s+(?:corrected|rewritten|revised|formal|concise)\s+(?:text|version|sentence)(?:\s+is)?\s*:?\s*",
            CleanupAction::Remove,
        ),
        CleanupRule::new(
            "label_preamble",
            r"(?i)\A(?:the text is|corrected(?: text)?|revised(?: text)?|correction)\s*:\s*",
            CleanupAction::Remove,
        ),
        CleanupRule::new(
            "enclosing_quotes",
            r#"(?s)\A"([^"]*)"\z"#,
            CleanupAction::UnwrapUnlessInputQuoted(1),
        ),
        CleanupRule::new(
            "explanation_postamble",
            r"(?i)\n\s*(?:I made the following changes|Changes made|Here are the changes|I changed|I have (?:corrected|changed|fixed|made|updated)|The text|Here is|Note:|Explanation:)",
            CleanupAction::TruncateAtMatch,
        ),
    ])
});

impl CleanupPipeline {
    pub fn new(rules: impl IntoIterator<Item = Option<CleanupRule>>) -> Self {
        Self {
            rules: rules.into_iter().flatten().collect(),
        }
    }

    pub fn standard() -> &'static CleanupPipeline {
        &STANDARD_RULES
    }

    pub fn rules(&self) -> &[CleanupRule] {
        &self.rules
    }

    /// Runs every rule in order over the trimmed response. The result is
    /// trimmed again and may be empty.
    pub fn apply(&self, raw: &str, input: &str) -> String {
        let mut text = raw.trim().to_string();
        for rule in &self.rules {
            if let Some(rewritten) = rule.apply(&text, input) {
                debug!(rule = rule.name, "cleanup rule applied");
                text = rewritten.trim().to_string();
            }
        }
        text
    }
}

/// Cleans `raw` with the standard rule list.
pub fn clean_response(raw: &str, input: &str) -> String {
    CleanupPipeline::standard().apply(raw, input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str) -> &'static CleanupRule {
        CleanupPipeline::standard()
            .rules()
            .iter()
            .find(|rule| rule.name == name)
            .expect("rule should exist")
    }

    #[test]
    fn every_standard_rule_compiles() {
        let names: Vec<&str> = CleanupPipeline::standard()
            .rules()
            .iter()
            .map(|rule| rule.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "fence_open",
                "fence_close",
                "quoted_answer",
                "announced_preamble",
                "label_preamble",
                "enclosing_quotes",
                "explanation_postamble",
            ]
        );
    }

    #[test]
    fn invalid_pattern_drops_only_that_rule() {
        let pipeline = CleanupPipeline::new([
            CleanupRule::new("broken", r"(unclosed", CleanupAction::Remove),
            CleanupRule::new("trailing_bang", r"!+\z", CleanupAction::Remove),
        ]);

        assert_eq!(pipeline.rules().len(), 1);
        assert_eq!(pipeline.rules()[0].name, "trailing_bang");
        assert_eq!(pipeline.apply("Hello sword!!", "ello sword"), "Hello sword");
    }

    #[test]
    fn plain_answer_passes_through() {
        assert_eq!(
            clean_response("  I have an apple.\n", "i has a apple"),
            "I have an apple."
        );
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(
            clean_response("```text\nHello sword\n```", "ello sword"),
            "Hello sword"
        );
        assert_eq!(
            clean_response("```\nHello sword\n```", "ello sword"),
            "Hello sword"
        );
    }

    #[test]
    fn verbose_response_yields_quoted_span() {
        let raw = "The sentence has two mistakes. The corrected version is \"I have an apple.\" because the verb must agree.";
        assert_eq!(clean_response(raw, "i has a apple"), "I have an apple.");
    }

    #[test]
    fn short_quoted_dialogue_is_left_alone() {
        let raw = "She said \"hello\" to me.";
        assert_eq!(clean_response(raw, "she say \"hello\" to me"), raw);
    }

    #[test]
    fn announced_preamble_is_removed() {
        assert_eq!(
            clean_response("Here is the corrected text: I have an apple.", "i has a apple"),
            "I have an apple."
        );
        assert_eq!(
            clean_response("Sure, here is the rewritten version:\n\nWe regret the delay.", "sorry its late"),
            "We regret the delay."
        );
    }

    #[test]
    fn label_preamble_is_removed() {
        assert_eq!(clean_response("Corrected: Hello sword", "ello sword"), "Hello sword");
    }

    #[test]
    fn answer_starting_with_i_have_survives() {
        assert_eq!(clean_response("I have an apple.", "i has a apple"), "I have an apple.");
    }

    #[test]
    fn enclosing_quotes_unwrap_only_for_unquoted_input() {
        let unwrap = rule("enclosing_quotes");
        assert_eq!(
            unwrap.apply("\"Hello sword\"", "ello sword"),
            Some("Hello sword".to_string())
        );
        assert_eq!(unwrap.apply("\"Hello sword\"", "\"ello sword\""), None);
    }

    #[test]
    fn trailing_explanation_is_truncated() {
        let raw = "I have an apple.\n\nI made the following changes:\n- has -> have\n- a -> an";
        assert_eq!(clean_response(raw, "i has a apple"), "I have an apple.");

        let raw = "Hello sword\nNote: capitalised the first word.";
        assert_eq!(clean_response(raw, "ello sword"), "Hello sword");
    }

    #[test]
    fn explanation_only_response_cleans_to_empty() {
        assert_eq!(clean_response("Here is the corrected text:", "abc"), "");
    }

    #[test]
    fn rules_run_in_declared_order() {
        let names: Vec<&str> = CleanupPipeline::standard()
            .rules()
            .iter()
            .map(|rule| rule.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "fence_open",
                "fence_close",
                "quoted_answer",
                "announced_preamble",
                "label_preamble",
                "enclosing_quotes",
                "explanation_postamble",
            ]
        );
    }

    #[test]
    fn truncate_reports_no_change_without_match() {
        assert_eq!(rule("explanation_postamble").apply("Hello", "hello"), None);
    }
}
