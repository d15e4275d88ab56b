//! Line framing for terminal output.
//!
//! The benchmark writes to a terminal, so output arrives in arbitrary chunks
//! and interactive prompts often never end with a newline. The framer turns
//! that stream into discrete log lines:
//!
//! - every complete line (up to `\n`) is emitted, trimmed;
//! - after line extraction, the leftover partial line is offered to a
//!   [`PromptHeuristic`]; if it looks like a prompt it is emitted right away
//!   so an observer can answer it.
//!
//! Prompt detection is best-effort. A prompt the heuristic does not
//! recognize only shows up once a newline arrives or the stream ends.

use regex::Regex;

/// Decides whether a partial, newline-less line should be flushed early.
pub trait PromptHeuristic: Send {
    /// `pending` is the trimmed leftover after all complete lines were taken.
    fn is_prompt(&self, pending: &str) -> bool;
}

/// Flushes partial lines ending in one of a few delimiter characters.
///
/// The default delimiter is `:` which covers `Continue (y/n):` style prompts.
#[derive(Debug, Clone)]
pub struct DelimiterSuffix {
    delimiters: Vec<char>,
}

impl DelimiterSuffix {
    pub fn new(delimiters: impl IntoIterator<Item = char>) -> Self {
        Self {
            delimiters: delimiters.into_iter().collect(),
        }
    }
}

impl Default for DelimiterSuffix {
    fn default() -> Self {
        Self::new([':'])
    }
}

impl PromptHeuristic for DelimiterSuffix {
    fn is_prompt(&self, pending: &str) -> bool {
        pending
            .chars()
            .last()
            .is_some_and(|c| self.delimiters.contains(&c))
    }
}

/// Flushes partial lines matching a regular expression.
#[derive(Debug, Clone)]
pub struct PatternPrompt {
    pattern: Regex,
}

impl PatternPrompt {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl PromptHeuristic for PatternPrompt {
    fn is_prompt(&self, pending: &str) -> bool {
        self.pattern.is_match(pending)
    }
}

/// Stateful splitter from text chunks to log lines.
pub struct LineFramer {
    buffer: String,
    heuristic: Box<dyn PromptHeuristic>,
}

impl LineFramer {
    pub fn new(heuristic: Box<dyn PromptHeuristic>) -> Self {
        Self {
            buffer: String::new(),
            heuristic,
        }
    }

    /// Feed one chunk, returning the lines it completed, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let rest = self.buffer.split_off(newline_pos + 1);
            let line = std::mem::replace(&mut self.buffer, rest);
            lines.push(line.trim().to_string());
        }

        let pending = self.buffer.trim();
        if !pending.is_empty() && self.heuristic.is_prompt(pending) {
            lines.push(pending.to_string());
            self.buffer.clear();
        }

        lines
    }

    /// Take whatever partial line is left, if it has any visible content.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    #[cfg(test)]
    fn pending(&self) -> &str {
        &self.buffer
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(Box::new(DelimiterSuffix::default()))
    }
}

/// Framer configuration.
#[derive(Debug, Clone)]
pub struct FramerSettings {
    /// Characters that mark a partial line as a prompt.
    pub prompt_delimiters: Vec<char>,
    /// Regex used instead of the delimiters when set.
    pub prompt_pattern: Option<String>,
    /// Emit the trailing partial line when the stream ends.
    pub flush_on_exit: bool,
}

impl Default for FramerSettings {
    fn default() -> Self {
        Self {
            prompt_delimiters: vec![':'],
            prompt_pattern: None,
            flush_on_exit: true,
        }
    }
}

impl FramerSettings {
    pub fn build(&self) -> Result<LineFramer, regex::Error> {
        let heuristic: Box<dyn PromptHeuristic> = match &self.prompt_pattern {
            Some(pattern) => Box::new(PatternPrompt::new(pattern)?),
            None => Box::new(DelimiterSuffix::new(self.prompt_delimiters.iter().copied())),
        };
        Ok(LineFramer::new(heuristic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn partial_line_joins_next_chunk() {
        let mut framer = LineFramer::default();
        let mut lines = framer.push("foo\nbar");
        lines.extend(framer.push("baz\n"));
        assert_eq!(lines, vec!["foo", "barbaz"]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn prompt_without_newline_is_flushed_trimmed() {
        let mut framer = LineFramer::default();
        let lines = framer.push("Continue (y/n): ");
        assert_eq!(lines, vec!["Continue (y/n):"]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn partial_line_without_delimiter_is_held() {
        let mut framer = LineFramer::default();
        assert!(framer.push("Encoding h264").is_empty());
        assert_eq!(framer.pending(), "Encoding h264");
        assert_eq!(framer.push(" done\n"), vec!["Encoding h264 done"]);
    }

    #[test]
    fn carriage_returns_from_the_terminal_are_trimmed() {
        let mut framer = LineFramer::default();
        let lines = framer.push("line one\r\nline two\r\n");
        assert_eq!(lines, vec!["line one", "line two"]);
    }

    #[test]
    fn blank_lines_are_kept() {
        let mut framer = LineFramer::default();
        assert_eq!(framer.push("a\n\nb\n"), vec!["a", "", "b"]);
    }

    #[test]
    fn whitespace_only_remainder_is_not_a_prompt() {
        let mut framer = LineFramer::default();
        assert_eq!(framer.push("done\n   "), vec!["done"]);
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn finish_returns_trailing_partial_line() {
        let mut framer = LineFramer::default();
        framer.push("last words");
        assert_eq!(framer.finish().as_deref(), Some("last words"));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn custom_delimiters() {
        let mut framer = LineFramer::new(Box::new(DelimiterSuffix::new(['?', '>'])));
        assert_eq!(framer.push("Proceed?"), vec!["Proceed?"]);
        assert_eq!(framer.push("> "), vec![">"]);
        assert!(framer.push("Value:").is_empty());
    }

    #[test]
    fn pattern_heuristic_matches_partial_line() {
        let heuristic = PatternPrompt::new(r"(?i)\[y/n\]$").unwrap();
        let mut framer = LineFramer::new(Box::new(heuristic));
        assert!(framer.push("Select codec:").is_empty());
        assert_eq!(framer.finish().as_deref(), Some("Select codec:"));
        assert_eq!(framer.push("Overwrite? [Y/n] "), vec!["Overwrite? [Y/n]"]);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(PatternPrompt::new("(unclosed").is_err());
        let settings = FramerSettings {
            prompt_pattern: Some("(unclosed".to_string()),
            ..FramerSettings::default()
        };
        assert!(settings.build().is_err());
    }

    #[test]
    fn settings_pattern_replaces_delimiters() {
        let settings = FramerSettings {
            prompt_pattern: Some(r"\?$".to_string()),
            ..FramerSettings::default()
        };
        let mut framer = settings.build().unwrap();
        assert!(framer.push("Device:").is_empty());
        assert_eq!(
            framer.push(" /dev/dri/renderD128 ok?"),
            vec!["Device: /dev/dri/renderD128 ok?"]
        );
    }

    proptest! {
        // Without prompt flushes, any chunking of the same text yields the
        // same lines in the same order.
        #[test]
        fn chunking_never_reorders_or_drops_lines(
            lines in prop::collection::vec("[a-z ]{0,12}", 1..12),
            cuts in prop::collection::vec(0usize..200, 0..8),
        ) {
            let text: String = lines.iter().map(|l| format!("{l}\n")).collect();
            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (text.len() + 1)).collect();
            cuts.sort_unstable();

            let mut framer = LineFramer::default();
            let mut out = Vec::new();
            let mut start = 0;
            for cut in cuts.into_iter().chain(std::iter::once(text.len())) {
                out.extend(framer.push(&text[start..cut]));
                start = cut;
            }

            let expected: Vec<String> = lines.iter().map(|l| l.trim().to_string()).collect();
            prop_assert_eq!(out, expected);
        }
    }
}
