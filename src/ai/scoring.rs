//! Prompt quality scoring.
//!
//! The orchestrator asks a [`PromptScorer`] to rank competing prompts. Scores
//! are in `0.0..=1.0`; higher is better.

use regex::Regex;

use crate::core::AssetRequest;

/// Ranks a candidate prompt for an asset.
pub trait PromptScorer: Send + Sync {
    fn score(&self, asset: &AssetRequest, prompt: &str) -> f64;
}

impl<F> PromptScorer for F
where
    F: Fn(&AssetRequest, &str) -> f64 + Send + Sync,
{
    fn score(&self, asset: &AssetRequest, prompt: &str) -> f64 {
        self(asset, prompt)
    }
}

/// Visual vocabulary a usable image prompt tends to contain.
const DESCRIPTORS: &[&str] = &[
    "composition",
    "lighting",
    "palette",
    "color",
    "colour",
    "background",
    "style",
    "texture",
    "shadow",
    "centered",
    "minimal",
    "detailed",
];

/// Length, relevance and hygiene heuristic.
#[derive(Debug, Clone)]
pub struct HeuristicScorer {
    min_words: usize,
    max_words: usize,
    words: Regex,
    markdown: Regex,
    refusal: Regex,
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicScorer {
    pub fn new() -> Self {
        Self::with_length(12, 80)
    }

    /// Scorer preferring prompts between `min_words` and `max_words` words.
    pub fn with_length(min_words: usize, max_words: usize) -> Self {
        // Patterns are constant.
        let compile = |pattern: &str| Regex::new(pattern).unwrap();
        Self {
            min_words,
            max_words: max_words.max(min_words),
            words: compile(r"[A-Za-z0-9]+"),
            markdown: compile(r"(?m)(^\s*#{1,6}\s|^\s*[-*]\s|\*\*|```|^\s*\d+\.\s)"),
            refusal: compile(
                r"(?i)\b(i can(?:no|')t|i'm unable|i am unable|as an ai|i'm sorry|here is|here's|sure[,!])",
            ),
        }
    }

    fn length_score(&self, word_count: usize) -> f64 {
        if word_count == 0 {
            0.0
        } else if word_count < self.min_words {
            word_count as f64 / self.min_words as f64
        } else if word_count <= self.max_words {
            1.0
        } else {
            (self.max_words as f64 / word_count as f64).max(0.1)
        }
    }

    fn relevance_score(&self, asset: &AssetRequest, lowered: &str) -> f64 {
        let mut terms: Vec<String> =
            self.words.find_iter(&asset.name).map(|m| m.as_str().to_lowercase()).collect();
        terms.push(asset.category.to_string());
        terms.retain(|t| t.len() > 2);
        if terms.is_empty() {
            return 1.0;
        }
        let hits = terms.iter().filter(|t| lowered.contains(t.as_str())).count();
        hits as f64 / terms.len() as f64
    }
}

impl PromptScorer for HeuristicScorer {
    fn score(&self, asset: &AssetRequest, prompt: &str) -> f64 {
        let prompt = prompt.trim();
        let word_count = self.words.find_iter(prompt).count();
        if word_count == 0 {
            return 0.0;
        }
        let lowered = prompt.to_lowercase();

        let descriptors = DESCRIPTORS.iter().filter(|d| lowered.contains(*d)).count();
        let descriptor_score = (descriptors as f64 / 3.0).min(1.0);

        let mut score = 0.35 * self.length_score(word_count)
            + 0.40 * self.relevance_score(asset, &lowered)
            + 0.25 * descriptor_score;

        if self.markdown.is_match(prompt) {
            score *= 0.7;
        }
        if self.refusal.is_match(prompt) {
            score *= 0.3;
        }
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AssetCategory;

    fn asset() -> AssetRequest {
        AssetRequest::new(AssetCategory::Icon, "focus-timer")
    }

    const GOOD: &str = "Minimal flat icon of a focus timer, a rounded hourglass with a calm \
                        teal palette, centered composition on a soft background, gentle lighting";

    #[test]
    fn test_empty_prompt_scores_zero() {
        let scorer = HeuristicScorer::new();
        assert_eq!(scorer.score(&asset(), "   "), 0.0);
    }

    #[test]
    fn test_relevant_descriptive_prompt_beats_vague_one() {
        let scorer = HeuristicScorer::new();
        let good = scorer.score(&asset(), GOOD);
        let vague = scorer.score(&asset(), "a nice picture");
        assert!(good > vague, "{good} <= {vague}");
        assert!(good > 0.9);
    }

    #[test]
    fn test_markdown_and_refusals_are_penalized() {
        let scorer = HeuristicScorer::new();
        let clean = scorer.score(&asset(), GOOD);
        let markdown = scorer.score(&asset(), &format!("**Prompt:** {GOOD}"));
        let refusal = scorer.score(&asset(), &format!("Sure, here is a prompt: {GOOD}"));
        assert!(markdown < clean);
        assert!(refusal < markdown);
    }

    #[test]
    fn test_overlong_prompt_loses_length_credit() {
        let scorer = HeuristicScorer::with_length(5, 20);
        let long = format!("{GOOD} {}", "extra ".repeat(60));
        assert!(scorer.score(&asset(), &long) < scorer.score(&asset(), GOOD));
    }

    #[test]
    fn test_closures_are_scorers() {
        let by_length = |_: &AssetRequest, p: &str| p.len() as f64;
        assert_eq!(by_length.score(&asset(), "abc"), 3.0);
    }
}
