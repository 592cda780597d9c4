//! Correction rules: post-translation literal/regex substitutions, scoped
//! by optional language pair and ordered `priority desc, created_at asc`
//! (§4.6 step 2d).

use chrono::{DateTime, Utc};
use regex::Regex;
use subtitler_common::{Result, SubtitlerError};

#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(String),
    Regex(Regex),
}

/// One correction rule. `id` is stable across runs so callers can record
/// which rules fired.
#[derive(Debug, Clone)]
pub struct CorrectionRule {
    pub id: u64,
    pub matcher: Matcher,
    pub replacement: String,
    pub case_sensitive: bool,
    pub source_lang: Option<String>,
    pub target_lang: Option<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl CorrectionRule {
    pub fn literal(
        id: u64,
        find: impl Into<String>,
        replace: impl Into<String>,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            matcher: Matcher::Literal(find.into()),
            replacement: replace.into(),
            case_sensitive: true,
            source_lang: None,
            target_lang: None,
            priority,
            created_at,
        }
    }

    pub fn regex(
        id: u64,
        pattern: &str,
        replace: impl Into<String>,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| SubtitlerError::BadInput(format!("invalid correction regex: {e}")))?;
        Ok(Self {
            id,
            matcher: Matcher::Regex(regex),
            replacement: replace.into(),
            case_sensitive: true,
            source_lang: None,
            target_lang: None,
            priority,
            created_at,
        })
    }

    pub fn for_languages(mut self, source_lang: Option<&str>, target_lang: Option<&str>) -> Self {
        self.source_lang = source_lang.map(str::to_string);
        self.target_lang = target_lang.map(str::to_string);
        self
    }

    fn applies_to(&self, source_lang: &str, target_lang: &str) -> bool {
        self.source_lang
            .as_deref()
            .map(|l| l == source_lang)
            .unwrap_or(true)
            && self
                .target_lang
                .as_deref()
                .map(|l| l == target_lang)
                .unwrap_or(true)
    }

    /// Applies this rule to `text`, returning the (possibly unchanged) text
    /// and whether it actually changed anything — a rule only counts as
    /// "applied" if it changed the text (§4.6).
    fn apply(&self, text: &str) -> (String, bool) {
        let result = match &self.matcher {
            Matcher::Literal(find) => {
                if self.case_sensitive {
                    text.replace(find.as_str(), &self.replacement)
                } else {
                    replace_case_insensitive(text, find, &self.replacement)
                }
            }
            Matcher::Regex(re) => re.replace_all(text, self.replacement.as_str()).into_owned(),
        };
        let changed = result != text;
        (result, changed)
    }
}

fn replace_case_insensitive(text: &str, find: &str, replace: &str) -> String {
    if find.is_empty() {
        return text.to_string();
    }
    let lower_text = text.to_lowercase();
    let lower_find = find.to_lowercase();
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    let mut rest_lower = lower_text.as_str();
    while let Some(pos) = rest_lower.find(&lower_find) {
        result.push_str(&rest[..pos]);
        result.push_str(replace);
        rest = &rest[pos + find.len()..];
        rest_lower = &rest_lower[pos + find.len()..];
    }
    result.push_str(rest);
    result
}

/// Runs every rule applicable to `(source_lang, target_lang)` against
/// `text` in sorted order, returning the final text and the ids of the
/// rules that changed it.
pub fn apply_rules(
    rules: &[CorrectionRule],
    text: &str,
    source_lang: &str,
    target_lang: &str,
) -> (String, Vec<u64>) {
    let mut ordered: Vec<&CorrectionRule> = rules
        .iter()
        .filter(|r| r.applies_to(source_lang, target_lang))
        .collect();
    ordered.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });

    let mut current = text.to_string();
    let mut applied = Vec::new();
    for rule in ordered {
        let (next, changed) = rule.apply(&current);
        if changed {
            applied.push(rule.id);
        }
        current = next;
    }
    (current, applied)
}
