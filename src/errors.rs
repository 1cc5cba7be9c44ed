// File: src/errors.rs
//
// Error types for the Lox compiler and virtual machine, plus their
// pretty-printed rendering. Compile errors accumulate under panic-mode
// recovery so a single `run` call can report more than one syntax
// mistake; a runtime error carries the call-stack trace captured at the
// point of failure.

use colored::Colorize;
use std::fmt;

/// Where in a compile error a token pointed — used to render
/// `at 'lexeme'` vs. `at end`.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenContext {
    Eof,
    Lexeme(String),
}

#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub at: TokenContext,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let where_str = match &self.at {
            TokenContext::Eof => "at end".to_string(),
            TokenContext::Lexeme(lexeme) => format!("at '{lexeme}'"),
        };
        write!(
            f,
            "{} {}: {}",
            format!("[line {}] Error", self.line).red().bold(),
            where_str,
            self.message
        )
    }
}

/// One frame of a runtime stack trace, innermost call first.
#[derive(Debug, Clone)]
pub struct FrameTrace {
    pub line: u32,
    pub function_name: String,
}

impl fmt::Display for FrameTrace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.function_name == "script" {
            write!(f, "[line {}] in script", self.line)
        } else {
            write!(f, "[line {}] in {}()", self.line, self.function_name)
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    /// Innermost frame first, matching the order the VM unwound them in.
    pub trace: Vec<FrameTrace>,
    /// Populated for "Undefined variable"-style errors when a close
    /// global/field name exists — see `find_closest_match`.
    pub suggestion: Option<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError { message: message.into(), trace: Vec::new(), suggestion: None }
    }

    pub fn with_suggestion(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}: {}", "Runtime Error".red().bold(), self.message)?;
        if let Some(suggestion) = &self.suggestion {
            writeln!(f, "  {} {}", "=".bright_yellow(), format!("did you mean '{suggestion}'?").bright_yellow())?;
        }
        for frame in &self.trace {
            writeln!(f, "  {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Computes the Levenshtein edit distance between two strings, used for
/// "did you mean" suggestions on undefined-name errors.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let len1 = s1_chars.len();
    let len2 = s2_chars.len();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0usize; len2 + 1]; len1 + 1];
    for (i, row) in matrix.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            matrix[i][j] = std::cmp::min(
                std::cmp::min(matrix[i - 1][j] + 1, matrix[i][j - 1] + 1),
                matrix[i - 1][j - 1] + cost,
            );
        }
    }
    matrix[len1][len2]
}

/// The closest candidate to `target` within edit distance 3, if any.
pub fn find_closest_match<'a, I>(target: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(&str, usize)> = None;
    for candidate in candidates {
        let distance = levenshtein_distance(target, candidate);
        if distance <= 3 && best.as_ref().map(|(_, d)| distance < *d).unwrap_or(true) {
            best = Some((candidate, distance));
        }
    }
    best.map(|(name, _)| name.to_string())
}
