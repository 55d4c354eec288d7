//! Prompt-injection detection and sanitization.
//!
//! Every free-text field that originates outside the engine (CVE
//! descriptions, scanner asset metadata) passes through here before it
//! is interpolated into an LLM prompt. Detection never raises; flagged
//! content is logged and, depending on the level, stripped. Sanitized
//! output is never longer than the input.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use patchforge_core::SanitizationLevel;

/// Maximum input length before truncation, in characters.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 10_000;

/// A compiled injection pattern and its attack category.
struct InjectionPattern {
    regex: Regex,
    category: &'static str,
}

fn pattern(raw: &str, category: &'static str) -> InjectionPattern {
    InjectionPattern {
        regex: Regex::new(&format!("(?i){raw}")).expect("injection pattern is valid"),
        category,
    }
}

static INJECTION_PATTERNS: Lazy<Vec<InjectionPattern>> = Lazy::new(|| {
    vec![
        // Direct instruction override attempts
        pattern(
            r"ignore\s+(all\s+)?(previous|prior|above)\s+instructions?",
            "instruction_override",
        ),
        pattern(
            r"forget\s+(all\s+)?(previous|prior|above)\s+(instructions?|context)",
            "instruction_override",
        ),
        pattern(r"disregard\s+(all\s+)?(previous|prior|above)", "instruction_override"),
        // System message injection
        pattern(r"system\s*:\s*", "system_impersonation"),
        pattern(r"\[system\]", "system_impersonation"),
        pattern(r"<\|system\|>", "system_impersonation"),
        pattern(r"###\s*system", "system_impersonation"),
        // Role manipulation
        pattern(r"you\s+are\s+now\s+a", "role_manipulation"),
        pattern(r"pretend\s+to\s+be", "role_manipulation"),
        pattern(r"act\s+as\s+(if\s+)?you", "role_manipulation"),
        // Instruction leakage
        pattern(
            r"show\s+me\s+your\s+(instructions?|prompt|system\s+message)",
            "instruction_leak",
        ),
        pattern(
            r"what\s+(are|is)\s+your\s+(instructions?|rules|guidelines)",
            "instruction_leak",
        ),
        pattern(r"repeat\s+your\s+(instructions?|prompt)", "instruction_leak"),
        // Jailbreak tags
        pattern(r"DAN\s+mode", "jailbreak"),
        pattern(r"developer\s+mode", "jailbreak"),
        pattern(r"sudo\s+mode", "jailbreak"),
        // Code execution markers
        pattern(r"exec\s*\(", "code_execution"),
        pattern(r"eval\s*\(", "code_execution"),
        // Shell-command injection
        pattern(r";\s*rm\s+-rf", "shell_injection"),
        pattern(r"`[^`]+`", "shell_injection"),
        pattern(r"\|\s*nc\s+", "shell_injection"),
        // SQL injection
        pattern(r"'\s*or\s+1\s*=\s*1", "sql_injection"),
        pattern(r"union\s+select", "sql_injection"),
        // Path traversal
        pattern(r"\.\./\.\./", "path_traversal"),
        // Markup injection
        pattern(r"<script[\s>]", "xss"),
    ]
});

static SYSTEM_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?i)system\s*:\s*", r"(?i)\[system\]", r"(?i)<\|system\|>"]
        .iter()
        .map(|p| Regex::new(p).expect("marker pattern is valid"))
        .collect()
});

static OVERRIDE_PHRASES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+instructions?",
        r"(?i)DAN\s+mode",
        r"(?i)developer\s+mode",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("override pattern is valid"))
    .collect()
});

static STRICT_KEYWORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(system|instructions?|prompt)\b").expect("keyword pattern"));

static CODE_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```.*?```").expect("fence pattern"));

static DELIMITER_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[|<>]{2,}").expect("delimiter pattern"));

/// Detects and strips prompt-injection attempts in untrusted text.
pub struct PromptInjectionDetector {
    level: SanitizationLevel,
    max_input_chars: usize,
}

impl Default for PromptInjectionDetector {
    fn default() -> Self {
        Self::new(SanitizationLevel::Moderate)
    }
}

impl PromptInjectionDetector {
    pub fn new(level: SanitizationLevel) -> Self {
        Self {
            level,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }

    pub fn with_max_input_chars(mut self, max: usize) -> Self {
        self.max_input_chars = max;
        self
    }

    /// Check text for injection patterns; returns the first matching
    /// attack category.
    pub fn detect(&self, text: &str) -> Option<&'static str> {
        if text.is_empty() {
            return None;
        }
        for pattern in INJECTION_PATTERNS.iter() {
            if pattern.regex.is_match(text) {
                warn!(
                    "potential prompt injection detected (category: {})",
                    pattern.category
                );
                return Some(pattern.category);
            }
        }
        None
    }

    /// Sanitize text for prompt interpolation.
    ///
    /// Input is truncated to the configured maximum before matching. The
    /// result is always no longer than the input; flagged fragments are
    /// removed, not replaced. Never panics on any well-formed UTF-8.
    pub fn sanitize(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let mut text = if text.chars().count() > self.max_input_chars {
            warn!(
                "input truncated from {} to {} characters",
                text.chars().count(),
                self.max_input_chars
            );
            text.chars().take(self.max_input_chars).collect::<String>()
        } else {
            text.to_string()
        };

        let category = self.detect(&text);
        if category.is_none() || self.level == SanitizationLevel::Permissive {
            return text;
        }

        text = moderate_sanitize(&text);
        if self.level == SanitizationLevel::Strict {
            text = strict_sanitize(&text);
            warn!(
                "applied strict sanitization (category: {}); legitimate content may be affected",
                category.unwrap_or("unknown")
            );
        } else {
            info!(
                "applied moderate sanitization (category: {})",
                category.unwrap_or("unknown")
            );
        }

        text
    }
}

/// Remove overt injection markers: system prefixes, instruction-override
/// phrases and jailbreak tags.
fn moderate_sanitize(text: &str) -> String {
    let mut out = text.to_string();
    for marker in SYSTEM_MARKERS.iter() {
        out = marker.replace_all(&out, "").into_owned();
    }
    for phrase in OVERRIDE_PHRASES.iter() {
        out = phrase.replace_all(&out, "").into_owned();
    }
    out
}

/// Aggressive removal on top of the moderate pass: prompt-vocabulary
/// keywords, code fences and delimiter runs.
fn strict_sanitize(text: &str) -> String {
    let mut out = STRICT_KEYWORDS.replace_all(text, "").into_owned();
    out = CODE_FENCES.replace_all(&out, "").into_owned();
    out = DELIMITER_RUNS.replace_all(&out, " ").into_owned();
    out
}
