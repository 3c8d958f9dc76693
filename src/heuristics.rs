//! Local prompt heuristics
//!
//! A network-free prompt scorer built from regex signals. Used when prompt
//! scoring is set to `local`, and cheap enough to run on a short quiet period.

use crate::monitor::debounce::PromptScorer;
use crate::protocol::{PromptAnalysis, GENERAL_CONTEXT};
use crate::Result;
use async_trait::async_trait;
use regex::Regex;

const BASE_SCORE: f64 = 3.0;
const MAX_STRENGTHS: usize = 4;
const MAX_SUGGESTIONS: usize = 3;

/// A scored property of a prompt
struct Signal {
    pattern: Regex,
    weight: f64,
    strength: &'static str,
    suggestion: &'static str,
}

/// Regex-based prompt scorer
pub struct HeuristicScorer {
    signals: Vec<Signal>,
    domains: Vec<(&'static str, Regex)>,
}

impl HeuristicScorer {
    pub fn new() -> Self {
        Self {
            signals: Self::compile_signals(),
            domains: Self::compile_domains(),
        }
    }

    fn compile_signals() -> Vec<Signal> {
        vec![
            Signal {
                pattern: Regex::new(r"(?i)(\?\s*$|^\s*(how|what|why|when|where|which|can|could|would|should|explain|describe|compare)\b)").unwrap(),
                weight: 1.0,
                strength: "Clear question format",
                suggestion: "Phrase the request as a direct question or instruction",
            },
            Signal {
                pattern: Regex::new(r"(?i)\b(i'm|i am|i have|i've|my|we're|our|because|context|background|currently)\b").unwrap(),
                weight: 1.0,
                strength: "Provides context",
                suggestion: "Add background on what you're working on",
            },
            Signal {
                pattern: Regex::new(r#"(?i)(`[^`]+`|"[^"]+"|\b\d+(\.\d+)?\b|\b(version|v\d)\b)"#).unwrap(),
                weight: 1.0,
                strength: "Includes specific details",
                suggestion: "Include specifics such as names, versions or numbers",
            },
            Signal {
                pattern: Regex::new(r"(?i)\b(must|should|without|only|at most|at least|limit|format|step[- ]by[- ]step|in \d+ (words|lines|bullets))\b").unwrap(),
                weight: 1.0,
                strength: "States constraints",
                suggestion: "State constraints like length, format or scope",
            },
            Signal {
                pattern: Regex::new(r"(?i)(\bfor example\b|\be\.g\.|\bsuch as\b|\blike this\b|\bexample\b)").unwrap(),
                weight: 1.0,
                strength: "Gives examples",
                suggestion: "Show an example of the output you expect",
            },
            Signal {
                pattern: Regex::new(r"(?i)\b(please|thanks|thank you)\b").unwrap(),
                weight: 0.5,
                strength: "Polite tone",
                suggestion: "",
            },
        ]
    }

    fn compile_domains() -> Vec<(&'static str, Regex)> {
        let table: [(&'static str, &str); 12] = [
            ("programming", r"\b(code|function|bug|compile|compiler|error|api|rust|python|javascript|typescript|sql|regex|debug|stack trace)\b"),
            ("writing", r"\b(essay|story|blog|email|rewrite|paragraph|proofread|article|tone)\b"),
            ("learning", r"\b(learn|understand|study|teach|tutorial|beginner|concept)\b"),
            ("business", r"\b(market|marketing|startup|revenue|customer|strategy|pitch|sales)\b"),
            ("creative", r"\b(poem|design|art|music|lyrics|logo|novel|character)\b"),
            ("health", r"\b(symptom|diet|exercise|sleep|workout|nutrition|doctor)\b"),
            ("legal", r"\b(contract|law|legal|lawsuit|copyright|license|liability)\b"),
            ("finance", r"\b(invest|investment|budget|tax|taxes|stock|loan|mortgage|savings)\b"),
            ("travel", r"\b(trip|flight|hotel|itinerary|visa|vacation|travel)\b"),
            ("cooking", r"\b(recipe|cook|bake|ingredient|ingredients|oven|dinner)\b"),
            ("science", r"\b(physics|chemistry|biology|experiment|hypothesis|molecule|quantum)\b"),
            ("gaming", r"\b(game|gaming|level|boss|speedrun|console)\b"),
        ];
        table
            .into_iter()
            .map(|(label, pattern)| (label, Regex::new(&format!("(?i){}", pattern)).unwrap()))
            .collect()
    }

    /// Most likely domain label; `general` when nothing matches.
    pub fn detect_context(&self, prompt: &str) -> &'static str {
        self.domains
            .iter()
            .map(|(label, re)| (*label, re.find_iter(prompt).count()))
            .filter(|(_, hits)| *hits > 0)
            .max_by_key(|(_, hits)| *hits)
            .map(|(label, _)| label)
            .unwrap_or(GENERAL_CONTEXT)
    }

    pub fn score(&self, prompt: &str) -> PromptAnalysis {
        let text = prompt.trim();
        let words = text.split_whitespace().count();

        let mut score = BASE_SCORE;
        let mut strengths = Vec::new();
        let mut suggestions = Vec::new();

        if words >= 20 {
            score += 1.5;
            strengths.push("Detailed request".to_string());
        } else if words >= 8 {
            score += 1.0;
        } else if words < 4 {
            score -= 1.0;
            suggestions.push("Add more detail about what you need".to_string());
        }

        let mut matched = 0usize;
        for signal in &self.signals {
            if signal.pattern.is_match(text) {
                matched += 1;
                score += signal.weight;
                strengths.push(signal.strength.to_string());
            } else if !signal.suggestion.is_empty() {
                suggestions.push(signal.suggestion.to_string());
            }
        }

        strengths.truncate(MAX_STRENGTHS);
        suggestions.truncate(MAX_SUGGESTIONS);

        PromptAnalysis {
            score: score.clamp(0.0, 10.0),
            context: self.detect_context(text).to_string(),
            strengths,
            suggestions,
            analysis: format!(
                "Local heuristic score from {} of {} prompt signals",
                matched,
                self.signals.len()
            ),
            error: false,
        }
    }
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PromptScorer for HeuristicScorer {
    async fn score_prompt(&self, prompt: &str) -> Result<PromptAnalysis> {
        Ok(self.score(prompt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rich_prompt_outscores_vague_prompt() {
        let scorer = HeuristicScorer::new();
        let vague = scorer.score("fix it");
        let rich = scorer.score(
            "I'm building a CLI in Rust 1.75 and my `serde` derive fails to compile. \
             Could you explain why, step by step, for example with a minimal struct? Please keep it under 200 words.",
        );

        assert!(rich.score > vague.score);
        assert!(rich.score <= 10.0);
        assert!(rich.strengths.len() <= MAX_STRENGTHS);
        assert!(!vague.suggestions.is_empty());
        assert!(vague.suggestions.len() <= MAX_SUGGESTIONS);
    }

    #[test]
    fn test_detect_context() {
        let scorer = HeuristicScorer::new();
        assert_eq!(scorer.detect_context("Why does this Python function throw an error?"), "programming");
        assert_eq!(scorer.detect_context("Give me a recipe for dinner with these ingredients"), "cooking");
        assert_eq!(scorer.detect_context("hello there"), "general");
    }

    #[tokio::test]
    async fn test_scorer_trait_never_fails() {
        let scorer = HeuristicScorer::new();
        let analysis = scorer.score_prompt("What is a lifetime in Rust?").await.unwrap();
        assert!(!analysis.error);
        assert!(analysis.strengths.iter().any(|s| s == "Clear question format"));
    }
}
