use regex::{Regex, RegexBuilder};
use std::sync::LazyLock;

use crate::models::{FieldMap, ListingEnrichment};

/// Longest description kept on a listing row.
pub const DESCRIPTION_LIMIT: usize = 4000;

const LICENSE_PHRASES: &[&str] = &[
    "driver's license",
    "driver's licence",
    "drivers license",
    "drivers licence",
    "own transport",
    "own car",
    "vehicle required",
    "forklift",
];

const NO_EXPERIENCE_PHRASES: &[&str] = &[
    "no experience",
    "no prior experience",
    "training provided",
    "on the job training",
    "on-the-job training",
];

const SENIOR_TITLES: &[&str] = &["manager", "supervisor", "senior", "lead"];
const ENTRY_TITLES: &[&str] = &["trainee", "junior", "crew", "team member", "assistant", "hand"];

/// Derives the extended listing fields from a fetched detail page.
pub fn derive(title: &str, detail: &FieldMap) -> ListingEnrichment {
    let description = detail.get("description").map(String::as_str).unwrap_or("");
    let lower = description.to_lowercase();

    let pay_rate = detail
        .get("pay_rate")
        .or_else(|| detail.get("salary"))
        .cloned()
        .or_else(|| extract_pay(description));

    ListingEnrichment {
        description: truncate_chars(description, DESCRIPTION_LIMIT),
        pay_rate,
        closing_date: extract_closing_date(description),
        schedule: detail
            .get("work_type")
            .cloned()
            .or_else(|| detect_schedule(&lower)),
        experience_level: Some(classify_experience(title).to_string()),
        requires_license: mentions_any(&lower, LICENSE_PHRASES),
        no_experience: mentions_any(&lower, NO_EXPERIENCE_PHRASES),
    }
}

impl ListingEnrichment {
    /// Merges the derived values into a field map so criteria can target them.
    pub fn extend_fields(&self, fields: &mut FieldMap) {
        let optional = [
            ("pay_rate", &self.pay_rate),
            ("closing_date", &self.closing_date),
            ("schedule", &self.schedule),
            ("experience_level", &self.experience_level),
        ];
        for (name, value) in optional {
            if let Some(v) = value {
                fields.entry(name.to_string()).or_insert_with(|| v.clone());
            }
        }
        fields.insert("requires_license".to_string(), yes_no(self.requires_license));
        fields.insert("no_experience".to_string(), yes_no(self.no_experience));
    }
}

fn yes_no(flag: bool) -> String {
    if flag { "yes" } else { "no" }.to_string()
}

fn mentions_any(lower: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| lower.contains(p))
}

fn case_insensitive(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("enrichment pattern is valid")
}

/// Hourly, weekly, then annual amounts, in order of preference.
static PAY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let amount = r"\$\d{1,3}(?:,\d{3})*(?:\.\d{2})?(?:\s*-\s*\$?\d{1,3}(?:,\d{3})*(?:\.\d{2})?)?";
    [
        r"(?:per hour|an hour|/hr|/hour|hourly|p/h|ph\b)",
        r"(?:per week|a week|/wk|weekly)",
        r"(?:per year|per annum|a year|annual|annum|p\.a\.|pa\b)",
    ]
    .iter()
    .map(|unit| case_insensitive(&format!(r"{}\s*{}", amount, unit)))
    .collect()
});

static RE_CLOSING: LazyLock<Regex> = LazyLock::new(|| {
    case_insensitive(
        r"(?:closes?|closing date|apply by)\s*:?\s+(?:on\s+)?(\d{1,2}\s+[a-z]+\s+\d{4}|\d{1,2}/\d{1,2}/\d{4})",
    )
});

/// First hourly, weekly, or annual dollar amount, in that order of preference.
pub fn extract_pay(text: &str) -> Option<String> {
    PAY_PATTERNS
        .iter()
        .find_map(|re| re.find(text))
        .map(|m| m.as_str().trim().to_string())
}

pub fn extract_closing_date(text: &str) -> Option<String> {
    Some(RE_CLOSING.captures(text)?.get(1)?.as_str().to_string())
}

pub fn detect_schedule(lower: &str) -> Option<String> {
    let schedules = [
        (&["full time", "full-time"][..], "Full time"),
        (&["part time", "part-time"][..], "Part time"),
        (&["casual"][..], "Casual"),
        (&["contract", "temp"][..], "Contract/Temp"),
    ];
    schedules
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, label)| label.to_string())
}

pub fn classify_experience(title: &str) -> &'static str {
    let lower = title.to_lowercase();
    if SENIOR_TITLES.iter().any(|w| lower.contains(w)) {
        "Senior"
    } else if ENTRY_TITLES.iter().any(|w| lower.contains(w)) {
        "Entry"
    } else {
        "Mid"
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(description: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("description".to_string(), description.to_string());
        fields
    }

    #[test]
    fn test_extract_pay_prefers_hourly() {
        let text = "Salary $65,000 per annum or $32.50 per hour for casuals";
        assert_eq!(extract_pay(text).as_deref(), Some("$32.50 per hour"));
        assert_eq!(
            extract_pay("Earn $1,200 - $1,400 per week").as_deref(),
            Some("$1,200 - $1,400 per week")
        );
        assert_eq!(extract_pay("$70,000 p.a. plus super").as_deref(), Some("$70,000 p.a."));
        assert!(extract_pay("Competitive salary").is_none());
    }

    #[test]
    fn test_extract_pay_falls_back_to_annual_in_any_case() {
        assert_eq!(
            extract_pay("Package of $70,000 PER ANNUM plus super").as_deref(),
            Some("$70,000 PER ANNUM")
        );
        assert_eq!(extract_pay("Competitive pay"), None);
        assert_eq!(PAY_PATTERNS.len(), 3);
    }

    #[test]
    fn test_extract_closing_date() {
        assert_eq!(
            extract_closing_date("Applications close on 14 March 2026.").as_deref(),
            Some("14 March 2026")
        );
        assert_eq!(
            extract_closing_date("Please apply by 03/04/2026").as_deref(),
            Some("03/04/2026")
        );
        assert!(extract_closing_date("Apply now").is_none());
    }

    #[test]
    fn test_classify_experience_from_title() {
        assert_eq!(classify_experience("Warehouse Supervisor"), "Senior");
        assert_eq!(classify_experience("Store Team Member"), "Entry");
        assert_eq!(classify_experience("Storeperson"), "Mid");
    }

    #[test]
    fn test_derive_sets_flags_and_schedule() {
        let fields = detail(
            "Casual role. No experience needed, training provided. Forklift licence is a bonus.",
        );
        let e = derive("Warehouse Assistant", &fields);
        assert!(e.no_experience);
        assert!(e.requires_license);
        assert_eq!(e.schedule.as_deref(), Some("Casual"));
        assert_eq!(e.experience_level.as_deref(), Some("Entry"));
        assert!(e.pay_rate.is_none());
    }

    #[test]
    fn test_derive_prefers_extracted_salary_field() {
        let mut fields = detail("Pay is $25 per hour.");
        fields.insert("salary".to_string(), "$30 - $35 per hour".to_string());
        let e = derive("Picker", &fields);
        assert_eq!(e.pay_rate.as_deref(), Some("$30 - $35 per hour"));
    }

    #[test]
    fn test_description_is_truncated_on_char_boundary() {
        let long = "é".repeat(DESCRIPTION_LIMIT + 10);
        let e = derive("Picker", &detail(&long));
        assert_eq!(e.description.chars().count(), DESCRIPTION_LIMIT);
    }

    #[test]
    fn test_extend_fields_keeps_extracted_values() {
        let e = ListingEnrichment {
            schedule: Some("Casual".to_string()),
            requires_license: true,
            ..Default::default()
        };
        let mut fields = FieldMap::new();
        fields.insert("schedule".to_string(), "Full time".to_string());
        e.extend_fields(&mut fields);
        assert_eq!(fields["schedule"], "Full time");
        assert_eq!(fields["requires_license"], "yes");
        assert_eq!(fields["no_experience"], "no");
    }
}
