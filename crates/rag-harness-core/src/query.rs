//! Query preprocessing: cleaning, typo correction, acronym expansion,
//! synonym augmentation, and intent detection.
//!
//! The output's [`ProcessedQuery::expanded`] text is what gets vectorized.
//! Expansion only ever appends terms, so the original wording still
//! dominates the sparse side. The reranker scores against the raw question,
//! not against this text.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::error::ValidationError;

pub const DEFAULT_MAX_QUERY_CHARS: usize = 2000;
pub const DEFAULT_MAX_EXPANSION_TERMS: usize = 3;

const SPELL_CORRECTIONS: &[(&str, &str)] = &[
    ("confleunce", "confluence"),
    ("conflunce", "confluence"),
    ("confuence", "confluence"),
    ("confulence", "confluence"),
    ("authentification", "authentication"),
    ("authetication", "authentication"),
    ("athentication", "authentication"),
    ("authorisation", "authorization"),
    ("authorazation", "authorization"),
    ("configration", "configuration"),
    ("configuraiton", "configuration"),
    ("documnetation", "documentation"),
    ("documenation", "documentation"),
    ("enviroment", "environment"),
    ("enviornment", "environment"),
    ("intergration", "integration"),
    ("implmentation", "implementation"),
    ("respository", "repository"),
    ("repositroy", "repository"),
    ("permisson", "permission"),
    ("permisions", "permissions"),
    ("paramter", "parameter"),
    ("databse", "database"),
    ("datbase", "database"),
    ("endpint", "endpoint"),
    ("servre", "server"),
    ("managment", "management"),
    ("mangement", "management"),
    ("deployement", "deployment"),
    ("instalation", "installation"),
    ("acess", "access"),
    ("accses", "access"),
    ("requst", "request"),
    ("respone", "response"),
    ("reponse", "response"),
    ("serach", "search"),
    ("seach", "search"),
    ("qurey", "query"),
    ("vacaton", "vacation"),
    ("vaccation", "vacation"),
    ("polcy", "policy"),
    ("benifits", "benefits"),
];

const ACRONYMS: &[(&str, &str)] = &[
    ("pto", "paid time off"),
    ("wfh", "work from home"),
    ("sso", "single sign-on"),
    ("hr", "human resources"),
    ("faq", "frequently asked questions"),
    ("ci", "continuous integration"),
    ("k8s", "kubernetes"),
    ("oncall", "on-call rotation"),
];

const SYNONYMS: &[(&str, &[&str])] = &[
    ("api", &["rest", "endpoint"]),
    ("auth", &["authentication", "login", "sso"]),
    ("setup", &["configure", "install"]),
    ("install", &["setup", "configure"]),
    ("error", &["issue", "problem", "fix"]),
    ("fix", &["resolve", "solution"]),
    ("how to", &["guide", "steps"]),
    ("permission", &["access", "role"]),
    ("deploy", &["release", "publish"]),
    ("vacation", &["leave", "holiday"]),
    ("connect", &["integrate", "link"]),
    ("create", &["add", "new"]),
    ("delete", &["remove"]),
    ("update", &["edit", "modify"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
    Procedural,
    Definitional,
    Explanatory,
    Comparison,
    Troubleshooting,
    Navigational,
    General,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::Procedural => "procedural",
            QueryIntent::Definitional => "definitional",
            QueryIntent::Explanatory => "explanatory",
            QueryIntent::Comparison => "comparison",
            QueryIntent::Troubleshooting => "troubleshooting",
            QueryIntent::Navigational => "navigational",
            QueryIntent::General => "general",
        }
    }
}

/// Every stage of preprocessing, kept for logging and `search` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedQuery {
    pub original: String,
    pub cleaned: String,
    pub corrected: String,
    pub expanded: String,
    pub intent: QueryIntent,
    /// `(from, to)` pairs.
    pub corrections: Vec<(String, String)>,
    pub expansions: Vec<String>,
}

/// Lookup tables. Defaults are built in; custom entries override them.
#[derive(Debug, Clone)]
pub struct QueryDictionaries {
    pub spell_corrections: BTreeMap<String, String>,
    pub acronyms: BTreeMap<String, String>,
    /// Trigger phrase to related terms, checked in order.
    pub synonyms: Vec<(String, Vec<String>)>,
}

impl Default for QueryDictionaries {
    fn default() -> Self {
        Self {
            spell_corrections: SPELL_CORRECTIONS
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            acronyms: ACRONYMS
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            synonyms: SYNONYMS
                .iter()
                .map(|(t, terms)| (t.to_string(), terms.iter().map(|s| s.to_string()).collect()))
                .collect(),
        }
    }
}

impl QueryDictionaries {
    /// Merge custom tables over the current ones. Synonym triggers that
    /// already exist are replaced in place; new ones go last.
    pub fn merge(
        mut self,
        spell_corrections: &BTreeMap<String, String>,
        acronyms: &BTreeMap<String, String>,
        synonyms: &BTreeMap<String, Vec<String>>,
    ) -> Self {
        for (k, v) in spell_corrections {
            self.spell_corrections.insert(k.to_lowercase(), v.to_lowercase());
        }
        for (k, v) in acronyms {
            self.acronyms.insert(k.to_lowercase(), v.to_lowercase());
        }
        for (trigger, terms) in synonyms {
            let trigger = trigger.to_lowercase();
            let terms: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
            match self.synonyms.iter_mut().find(|(t, _)| *t == trigger) {
                Some(slot) => slot.1 = terms,
                None => self.synonyms.push((trigger, terms)),
            }
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryPreprocessor {
    dictionaries: QueryDictionaries,
    max_query_chars: usize,
    max_expansion_terms: usize,
}

impl Default for QueryPreprocessor {
    fn default() -> Self {
        Self::new(
            QueryDictionaries::default(),
            DEFAULT_MAX_QUERY_CHARS,
            DEFAULT_MAX_EXPANSION_TERMS,
        )
    }
}

impl QueryPreprocessor {
    pub fn new(dictionaries: QueryDictionaries, max_query_chars: usize, max_expansion_terms: usize) -> Self {
        Self {
            dictionaries,
            max_query_chars,
            max_expansion_terms,
        }
    }

    /// Reject empty or oversized input.
    pub fn validate(&self, raw: &str) -> Result<(), ValidationError> {
        if raw.trim().is_empty() {
            return Err(ValidationError::EmptyQuery);
        }
        let len = raw.chars().count();
        if len > self.max_query_chars {
            return Err(ValidationError::QueryTooLong {
                len,
                max: self.max_query_chars,
            });
        }
        Ok(())
    }

    pub fn process(&self, raw: &str) -> Result<ProcessedQuery, ValidationError> {
        self.validate(raw)?;

        let cleaned = clean(raw);
        if words(&cleaned).next().is_none() {
            return Err(ValidationError::EmptyQuery);
        }
        let (corrected, corrections) = self.correct(&cleaned);
        let intent = detect_intent(&corrected);
        let expansions = self.expansions(&corrected);

        let expanded = if expansions.is_empty() {
            corrected.clone()
        } else {
            format!("{} {}", corrected, expansions.join(" "))
        };

        Ok(ProcessedQuery {
            original: raw.to_string(),
            cleaned,
            corrected,
            expanded,
            intent,
            corrections,
            expansions,
        })
    }

    fn correct(&self, cleaned: &str) -> (String, Vec<(String, String)>) {
        let mut corrections = Vec::new();
        let out: Vec<String> = cleaned
            .split(' ')
            .map(|token| {
                let (word, tail) = split_trailing_punct(token);
                match self.dictionaries.spell_corrections.get(word) {
                    Some(fixed) => {
                        corrections.push((word.to_string(), fixed.clone()));
                        format!("{}{}", fixed, tail)
                    }
                    None => token.to_string(),
                }
            })
            .collect();
        (out.join(" "), corrections)
    }

    fn expansions(&self, corrected: &str) -> Vec<String> {
        let mut present: HashSet<String> = words(corrected).map(str::to_string).collect();
        let mut added = Vec::new();

        // Acronyms are not capped; they restate the query rather than widen it.
        for word in words(corrected) {
            if let Some(long) = self.dictionaries.acronyms.get(word) {
                if !contains_all(&present, long) && !added.contains(long) {
                    added.push(long.clone());
                }
            }
        }
        for a in &added {
            present.extend(words(a).map(str::to_string));
        }

        let mut synonyms = 0;
        'triggers: for (trigger, terms) in &self.dictionaries.synonyms {
            if !contains_all(&present, trigger) {
                continue;
            }
            for term in terms {
                if synonyms >= self.max_expansion_terms {
                    break 'triggers;
                }
                if contains_all(&present, term) {
                    continue;
                }
                present.extend(words(term).map(str::to_string));
                added.push(term.clone());
                synonyms += 1;
            }
        }
        added
    }
}

/// Trim, collapse whitespace, lowercase, and drop characters other than
/// word characters, whitespace, `-`, `?`, `.`, `'` and `"`.
pub fn clean(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let kept: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '_' | '-' | '?' | '.' | '\'' | '"'))
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn detect_intent(query: &str) -> QueryIntent {
    let q = query.to_lowercase();
    let starts = |prefixes: &[&str]| prefixes.iter().any(|p| q.starts_with(p));

    if starts(&["how to", "how do i", "how can i", "steps to"]) {
        return QueryIntent::Procedural;
    }
    if starts(&["what is", "what are", "define", "explain"]) {
        return QueryIntent::Definitional;
    }
    if q.starts_with("why") {
        return QueryIntent::Explanatory;
    }
    if q.contains(" vs ") || q.contains(" versus ") || q.contains("compare") {
        return QueryIntent::Comparison;
    }
    if ["error", "issue", "problem", "fix", "bug", "failed", "not working"]
        .iter()
        .any(|w| q.contains(w))
    {
        return QueryIntent::Troubleshooting;
    }
    if starts(&["where is", "find", "locate", "link to"]) {
        return QueryIntent::Navigational;
    }
    QueryIntent::General
}

/// Words with surrounding punctuation stripped.
fn words(s: &str) -> impl Iterator<Item = &str> {
    s.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
}

fn contains_all(present: &HashSet<String>, phrase: &str) -> bool {
    words(phrase).all(|w| present.contains(w))
}

fn split_trailing_punct(token: &str) -> (&str, &str) {
    let end = token
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_alphanumeric())
        .map_or(0, |(i, c)| i + c.len_utf8());
    token.split_at(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean("  How   to SETUP   conflunce API?! "), "how to setup conflunce api?");
        assert_eq!(clean("what's @the #plan"), "what's the plan");
    }

    #[test]
    fn test_spell_correction_keeps_punctuation() {
        let p = QueryPreprocessor::default();
        let out = p.process("how to setup conflunce?").unwrap();
        assert_eq!(out.corrected, "how to setup confluence?");
        assert_eq!(out.corrections, vec![("conflunce".to_string(), "confluence".to_string())]);
    }

    #[test]
    fn test_expansion_capped_and_deterministic() {
        let p = QueryPreprocessor::default();
        let out = p.process("how to setup the api").unwrap();
        assert_eq!(out.expansions, vec!["rest", "endpoint", "configure"]);
        assert_eq!(out.expanded, "how to setup the api rest endpoint configure");
        assert_eq!(out.intent, QueryIntent::Procedural);
    }

    #[test]
    fn test_expansion_skips_terms_already_present() {
        let p = QueryPreprocessor::default();
        let out = p.process("api endpoint").unwrap();
        assert_eq!(out.expansions, vec!["rest"]);
    }

    #[test]
    fn test_acronym_expansion() {
        let p = QueryPreprocessor::default();
        let out = p.process("How much PTO do I get?").unwrap();
        assert_eq!(out.expansions[0], "paid time off");
        assert!(out.expanded.starts_with("how much pto do i get? paid time off"));
    }

    #[test]
    fn test_vacation_query() {
        let p = QueryPreprocessor::default();
        let out = p.process("What is our vacation policy?").unwrap();
        assert_eq!(out.intent, QueryIntent::Definitional);
        assert!(out.expanded.contains("vacation policy"));
        assert!(out.expansions.contains(&"leave".to_string()));
    }

    #[test]
    fn test_validation() {
        let p = QueryPreprocessor::new(QueryDictionaries::default(), 10, 3);
        assert_eq!(p.process("   ").unwrap_err(), ValidationError::EmptyQuery);
        assert_eq!(p.process("!!!").unwrap_err(), ValidationError::EmptyQuery);
        assert_eq!(
            p.process("this is far too long").unwrap_err(),
            ValidationError::QueryTooLong { len: 20, max: 10 }
        );
    }

    #[test]
    fn test_intents() {
        assert_eq!(detect_intent("why is the build slow"), QueryIntent::Explanatory);
        assert_eq!(detect_intent("postgres vs mysql"), QueryIntent::Comparison);
        assert_eq!(detect_intent("login error on staging"), QueryIntent::Troubleshooting);
        assert_eq!(detect_intent("where is the runbook"), QueryIntent::Navigational);
        assert_eq!(detect_intent("team lunch schedule"), QueryIntent::General);
    }

    #[test]
    fn test_custom_dictionaries_merge() {
        let mut spell = BTreeMap::new();
        spell.insert("kuberentes".to_string(), "kubernetes".to_string());
        let mut syn = BTreeMap::new();
        syn.insert("api".to_string(), vec!["grpc".to_string()]);
        let dict = QueryDictionaries::default().merge(&spell, &BTreeMap::new(), &syn);
        let p = QueryPreprocessor::new(dict, 100, 3);
        let out = p.process("kuberentes api").unwrap();
        assert_eq!(out.corrected, "kubernetes api");
        assert_eq!(out.expansions, vec!["grpc"]);
    }
}
