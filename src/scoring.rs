use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::adapter::FieldTag;
use crate::models::{Criterion, CriterionItem, FieldMap, Impact, MatchMethod};

pub const BASE_SCORE: u8 = 3;
pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 5;

/// Which criteria apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// Summary pass: only criteria evaluable from the search card.
    CardView,
    /// Deep scan: every criterion.
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub score: u8,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
struct CompiledItem {
    term: String,
    impact: Impact,
    pattern: Option<Regex>,
}

impl CompiledItem {
    fn matches(&self, method: MatchMethod, haystack: &str) -> bool {
        match method {
            MatchMethod::Contains => haystack.contains(&self.term),
            MatchMethod::Equals => haystack.trim() == self.term,
            MatchMethod::StartsWith => haystack.trim_start().starts_with(&self.term),
            MatchMethod::EndsWith => haystack.trim_end().ends_with(&self.term),
            MatchMethod::Word | MatchMethod::Regex => self
                .pattern
                .as_ref()
                .is_some_and(|p| p.is_match(haystack)),
        }
    }
}

/// A criterion together with its list items, ready to evaluate.
#[derive(Debug, Clone)]
pub struct ScoringRule {
    pub criterion: Criterion,
    field: String,
    items: Vec<CompiledItem>,
}

impl ScoringRule {
    /// Compiles one rule. Items whose pattern does not compile are dropped.
    pub fn compile(criterion: Criterion, items: Vec<CriterionItem>) -> Self {
        let field = resolve_field(&criterion.field_name);
        let mut compiled = Vec::with_capacity(items.len());
        for item in items {
            let term = item.term.trim().to_lowercase();
            if term.is_empty() {
                continue;
            }
            let pattern = match criterion.method {
                MatchMethod::Word => build_pattern(&format!(r"\b{}\b", regex::escape(&term))),
                MatchMethod::Regex => build_pattern(item.term.trim()),
                _ => Ok(None),
            };
            match pattern {
                Ok(pattern) => compiled.push(CompiledItem {
                    term,
                    impact: item.impact,
                    pattern,
                }),
                Err(e) => warn!(
                    "Dropping item '{}' of criterion '{}': {}",
                    item.term, criterion.field_name, e
                ),
            }
        }
        Self {
            criterion,
            field,
            items: compiled,
        }
    }

    fn bounds(&self) -> (i32, i32, i32) {
        let max = self.criterion.maximum_score.clamp(MIN_SCORE, MAX_SCORE) as i32;
        (
            max,
            self.criterion.increase_score as i32,
            self.criterion.decrease_score as i32,
        )
    }
}

fn build_pattern(source: &str) -> Result<Option<Regex>, regex::Error> {
    RegexBuilder::new(source)
        .case_insensitive(true)
        .build()
        .map(Some)
}

/// Maps field-name aliases onto the listing fields adapters produce.
pub fn resolve_field(name: &str) -> String {
    let name = name.trim().to_lowercase();
    match name.as_str() {
        "job_title" => "title".to_string(),
        "employer" => "company".to_string(),
        "suburb" => "location".to_string(),
        "link" => "url".to_string(),
        _ => name,
    }
}

/// Ordered rules for one (user, site). Order is criterion insertion order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<ScoringRule>,
}

impl RuleSet {
    pub fn compile(rows: Vec<(Criterion, Vec<CriterionItem>)>) -> Self {
        let rules = rows
            .into_iter()
            .map(|(criterion, items)| ScoringRule::compile(criterion, items))
            .collect();
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self, scope: RuleScope) -> impl Iterator<Item = &ScoringRule> {
        self.rules
            .iter()
            .filter(move |r| scope == RuleScope::Full || r.criterion.card_view)
    }

    /// Extraction tags the adapter needs for criteria on non-standard fields.
    pub fn field_tags(&self) -> Vec<FieldTag> {
        self.rules
            .iter()
            .filter_map(|r| {
                let tag = r.criterion.tag.as_deref()?.trim();
                if tag.is_empty() {
                    return None;
                }
                Some(FieldTag {
                    field: r.field.clone(),
                    tag: tag.to_string(),
                    card_view: r.criterion.card_view,
                })
            })
            .collect()
    }

    pub fn score(&self, fields: &FieldMap, scope: RuleScope) -> Scored {
        let applicable: Vec<&ScoringRule> = self.rules(scope).collect();
        score(fields, &applicable)
    }
}

/// Scores a listing's fields against rules, in order.
///
/// Starts at [`BASE_SCORE`]. `increase` is capped at the criterion's
/// maximum, `decrease` floored at [`MIN_SCORE`]. `maximum` and `minimum`
/// set the score outright and stop evaluation.
pub fn score(fields: &FieldMap, rules: &[&ScoringRule]) -> Scored {
    let mut score = BASE_SCORE as i32;
    let mut reasons = Vec::new();

    'rules: for rule in rules {
        let Some(value) = fields.get(&rule.field) else {
            continue;
        };
        let haystack = value.to_lowercase();
        if haystack.trim().is_empty() {
            continue;
        }
        let (max, inc, dec) = rule.bounds();

        for item in &rule.items {
            if !item.matches(rule.criterion.method, &haystack) {
                continue;
            }
            match item.impact {
                Impact::Increase => {
                    if score < max {
                        score = (score + inc).min(max);
                    }
                }
                Impact::Decrease => {
                    score = (score - dec).max(MIN_SCORE as i32);
                }
                Impact::Maximum => score = max,
                Impact::Minimum => score = MIN_SCORE as i32,
            }
            reasons.push(format!("{}:{}:{}", rule.field, item.term, item.impact));
            if item.impact.is_terminal() {
                break 'rules;
            }
        }
    }

    Scored {
        score: score.clamp(MIN_SCORE as i32, MAX_SCORE as i32) as u8,
        reasons,
    }
}
