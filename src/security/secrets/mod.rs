mod patterns;

use base64::Engine;
use patterns::{builtin_patterns, entropy_candidates, EntropyCandidates, SecretPattern};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::warn;

/// Detection confidence tier. Ordering matters: redaction thresholds compare
/// against it and overlap resolution keeps the higher tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Possible,
    Probable,
    Definite,
}

/// A single secret occurrence, with byte offsets into the scanned text.
#[derive(Debug, Clone)]
pub struct Finding {
    pub confidence: Confidence,
    pub kind: String,
    pub service: Option<String>,
    pub start: usize,
    pub end: usize,
}

/// Options for [`SecretDetector::redact`].
#[derive(Debug, Clone)]
pub struct RedactOptions {
    pub min_confidence: Confidence,
    /// Keep `[REDACTED:type:service]` markers; false uses `replacement` verbatim.
    pub preserve_type: bool,
    pub replacement: String,
}

impl Default for RedactOptions {
    fn default() -> Self {
        Self {
            min_confidence: Confidence::Probable,
            preserve_type: true,
            replacement: "[REDACTED]".to_string(),
        }
    }
}

/// A runtime-added pattern for a known secret value (raw, base64, hex).
struct KnownSecretPattern {
    name: String,
    regex: Regex,
}

/// Pattern-based secret scanner with three confidence tiers.
///
/// Pure and stateless per call; constructed once at startup and shared.
pub struct SecretDetector {
    patterns: Vec<SecretPattern>,
    known_secrets: Vec<KnownSecretPattern>,
    entropy: EntropyCandidates,
}

impl SecretDetector {
    pub fn new() -> Self {
        Self {
            patterns: builtin_patterns(),
            known_secrets: Vec::new(),
            entropy: entropy_candidates(),
        }
    }

    /// Register known secret values for exact-match detection across encodings.
    ///
    /// For each secret that is 10+ chars, creates patterns matching the raw
    /// value, its base64 encodings (standard and URL-safe), and its hex
    /// encoding. Shorter values are skipped to avoid false positives.
    pub fn add_known_secrets(&mut self, secrets: &[(&str, &str)]) {
        for &(name, value) in secrets {
            if value.len() < 10 {
                continue;
            }
            let escaped = regex::escape(value);
            if let Ok(regex) = Regex::new(&escaped) {
                self.known_secrets.push(KnownSecretPattern {
                    name: name.to_string(),
                    regex,
                });
            }
            let b64_standard = base64::engine::general_purpose::STANDARD.encode(value.as_bytes());
            let b64_url_safe =
                base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(value.as_bytes());
            for b64 in [&b64_standard, &b64_url_safe] {
                if let Ok(regex) = Regex::new(&regex::escape(b64)) {
                    self.known_secrets.push(KnownSecretPattern {
                        name: name.to_string(),
                        regex,
                    });
                }
            }
            let mut hex_str = String::with_capacity(value.len() * 2);
            for b in value.as_bytes() {
                let _ = write!(hex_str, "{:02x}", b);
            }
            match Regex::new(&format!("(?i){}", regex::escape(&hex_str))) {
                Ok(regex) => self.known_secrets.push(KnownSecretPattern {
                    name: name.to_string(),
                    regex,
                }),
                Err(e) => warn!("failed to compile known-secret pattern '{}': {}", name, e),
            }
        }
    }

    /// Scan text for secrets. Findings are de-duplicated by location with
    /// precedence definite > probable > possible, then sorted by offset.
    pub fn scan(&self, text: &str) -> Vec<Finding> {
        let mut raw: Vec<Finding> = Vec::new();

        for pattern in &self.patterns {
            for m in pattern.regex.find_iter(text) {
                raw.push(Finding {
                    confidence: pattern.confidence,
                    kind: pattern.kind.to_string(),
                    service: pattern.service.map(str::to_string),
                    start: m.start(),
                    end: m.end(),
                });
            }
        }

        for ks in &self.known_secrets {
            for m in ks.regex.find_iter(text) {
                raw.push(Finding {
                    confidence: Confidence::Definite,
                    kind: "known_secret".to_string(),
                    service: Some(ks.name.clone()),
                    start: m.start(),
                    end: m.end(),
                });
            }
        }

        raw.extend(self.scan_entropy(text));

        raw.retain(|f| !is_false_positive(text, f));

        dedupe_by_location(raw)
    }

    /// Possible-tier scan: long base64/hex runs counted only when a secret
    /// keyword appears within the preceding 50 characters. Data-URI payloads
    /// are excluded.
    fn scan_entropy(&self, text: &str) -> Vec<Finding> {
        let mut findings = Vec::new();

        for (candidate_re, service) in [(&self.entropy.base64, "base64"), (&self.entropy.hex, "hex")]
        {
            for m in candidate_re.find_iter(text) {
                let context = context_window(text, m.start(), 50);
                if !self.entropy.context.is_match(context) {
                    continue;
                }
                if context.trim_end().ends_with(";base64,") || context.contains("data:") {
                    continue;
                }
                findings.push(Finding {
                    confidence: Confidence::Possible,
                    kind: "high_entropy".to_string(),
                    service: Some(service.to_string()),
                    start: m.start(),
                    end: m.end(),
                });
            }
        }

        findings
    }

    /// Redact findings at or above the threshold, rewriting right-to-left so
    /// earlier offsets stay valid.
    pub fn redact(&self, text: &str, opts: &RedactOptions) -> String {
        let mut findings: Vec<Finding> = self
            .scan(text)
            .into_iter()
            .filter(|f| f.confidence >= opts.min_confidence)
            .collect();
        findings.sort_by(|a, b| b.start.cmp(&a.start));

        let mut result = text.to_string();
        for f in findings {
            let marker = if opts.preserve_type {
                match &f.service {
                    Some(service) => format!("[REDACTED:{}:{}]", f.kind, service),
                    None => format!("[REDACTED:{}]", f.kind),
                }
            } else {
                opts.replacement.clone()
            };
            result.replace_range(f.start..f.end, &marker);
        }
        result
    }

    /// Redact at the default threshold (≥ probable) with typed markers.
    pub fn redact_default(&self, text: &str) -> String {
        self.redact(text, &RedactOptions::default())
    }

    /// Whether text is free of probable-or-higher findings. The invariant
    /// checked at every persistence boundary.
    pub fn is_clean(&self, text: &str) -> bool {
        self.scan(text)
            .iter()
            .all(|f| f.confidence < Confidence::Probable)
    }

    /// Counts-only metadata safe for audit: `type:service` → occurrences.
    pub fn summarize(findings: &[Finding]) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for f in findings {
            let key = match &f.service {
                Some(service) => format!("{}:{}", f.kind, service),
                None => f.kind.clone(),
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }

    /// Highest-confidence finding in the set, if any.
    pub fn max_confidence(findings: &[Finding]) -> Option<Confidence> {
        findings.iter().map(|f| f.confidence).max()
    }
}

impl Default for SecretDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// The up-to-`width` bytes of text preceding `end`, widened backward to a
/// character boundary so multi-byte text cannot split a slice.
fn context_window(text: &str, end: usize, width: usize) -> &str {
    let mut start = end.saturating_sub(width);
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    &text[start..end]
}

/// Overlap resolution: keep the higher-confidence finding when two ranges
/// intersect; stable by offset otherwise.
fn dedupe_by_location(mut findings: Vec<Finding>) -> Vec<Finding> {
    findings.sort_by(|a, b| b.confidence.cmp(&a.confidence).then(a.start.cmp(&b.start)));

    let mut kept: Vec<Finding> = Vec::new();
    for f in findings {
        let overlaps = kept.iter().any(|k| f.start < k.end && k.start < f.end);
        if !overlaps {
            kept.push(f);
        }
    }
    kept.sort_by_key(|f| f.start);
    kept
}

/// Drop matches that are clearly placeholder or non-secret content.
fn is_false_positive(text: &str, finding: &Finding) -> bool {
    let matched = &text[finding.start..finding.end];
    let lower = matched.to_ascii_lowercase();

    // Placeholder/documentation text never counts, at any tier
    if lower.contains("example")
        || lower.contains("placeholder")
        || lower.contains("your-")
        || lower.contains("your_")
        || lower.contains("xxxx")
        || (matched.contains('<') && matched.contains('>'))
    {
        return true;
    }

    if finding.confidence > Confidence::Possible {
        return false;
    }

    // Possible-tier extras: git object hashes in git-ish context
    if matched.len() == 40 && matched.chars().all(|c| c.is_ascii_hexdigit()) {
        let context = context_window(text, finding.start, 80).to_ascii_lowercase();
        if context.contains("commit") || context.contains("git") || context.contains("sha") {
            return true;
        }
    }

    // Doc-comment lines are reference material, not live credentials
    let line_start = text[..finding.start]
        .rfind('\n')
        .map_or(0, |i| i + 1);
    let line_prefix = text[line_start..finding.start].trim_start();
    if line_prefix.starts_with("///") || line_prefix.starts_with("//!") {
        return true;
    }

    false
}

#[cfg(test)]
mod tests;
