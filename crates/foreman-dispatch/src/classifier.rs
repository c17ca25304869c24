use std::sync::OnceLock;

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;

/// Fallback pause when quota error text carries no parseable reset time.
pub const FALLBACK_PAUSE_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    CredentialExpiry,
    QuotaExhausted,
    Other,
}

#[derive(Debug)]
pub struct ClassifierRule {
    pub pattern: Regex,
    pub kind: FailureKind,
}

/// There is no structured error channel from the agent process; failures
/// are recognized by case-insensitive pattern match over the raw captured
/// text. New phrasings are table entries, not control-flow changes.
#[derive(Debug)]
pub struct ErrorClassifier {
    rules: Vec<ClassifierRule>,
}

const CREDENTIAL_PATTERNS: &[&str] = &[
    r"credentials?\s+(?:have\s+)?expired",
    r"oauth token (?:has )?expired",
    r"authentication[_\s]error",
    r"invalid api key",
    r"please run /login",
    r"401 unauthorized",
];

const QUOTA_PATTERNS: &[&str] = &[
    r"rate[\s_-]?limit",
    r"\b429\b",
    r"usage (?:limit|cap)",
    r"hit your limit",
    r"quota",
    r"billing",
    r"out of credits",
];

impl Default for ErrorClassifier {
    fn default() -> Self {
        let mut rules = Vec::new();
        for pattern in CREDENTIAL_PATTERNS {
            rules.push(ClassifierRule {
                pattern: compile_case_insensitive(pattern),
                kind: FailureKind::CredentialExpiry,
            });
        }
        for pattern in QUOTA_PATTERNS {
            rules.push(ClassifierRule {
                pattern: compile_case_insensitive(pattern),
                kind: FailureKind::QuotaExhausted,
            });
        }
        Self { rules }
    }
}

fn compile_case_insensitive(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){pattern}")).unwrap_or_else(|error| {
        panic!("built-in classifier pattern '{pattern}' failed to compile: {error}")
    })
}

impl ErrorClassifier {
    pub fn with_rules(rules: Vec<ClassifierRule>) -> Self {
        Self { rules }
    }

    /// First matching rule wins; credential rules are ordered ahead of quota
    /// rules so an expired-token message mentioning billing pauses for
    /// reauthentication, not for a quota window.
    pub fn classify(&self, text: &str) -> FailureKind {
        for rule in &self.rules {
            if rule.pattern.is_match(text) {
                return rule.kind;
            }
        }
        FailureKind::Other
    }
}

static RESET_TIME_RE: OnceLock<Regex> = OnceLock::new();

fn reset_time_re() -> &'static Regex {
    RESET_TIME_RE.get_or_init(|| {
        Regex::new(r"(?i)resets?\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?(?:\s*\(([^)]+)\))?")
            .unwrap_or_else(|error| panic!("reset-time pattern failed to compile: {error}"))
    })
}

/// Parses a human-readable reset time such as
/// `resets 9pm (America/Mexico_City)` into the next occurrence of that wall
/// time in the named zone: today if still in the future, else tomorrow.
pub fn parse_reset_time(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = reset_time_re().captures(text)?;

    let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = match caps.get(2) {
        Some(group) => group.as_str().parse().ok()?,
        None => 0,
    };
    match caps.get(3).map(|group| group.as_str().to_ascii_lowercase()) {
        Some(meridiem) if meridiem == "pm" && hour < 12 => hour += 12,
        Some(meridiem) if meridiem == "am" && hour == 12 => hour = 0,
        _ => {}
    }
    if hour > 23 || minute > 59 {
        return None;
    }

    let zone: Tz = caps
        .get(4)
        .and_then(|group| group.as_str().trim().parse().ok())
        .unwrap_or(chrono_tz::UTC);

    let local_now = now.with_timezone(&zone);
    let today = local_now.date_naive().and_hms_opt(hour, minute, 0)?;
    let candidate = zone.from_local_datetime(&today).earliest()?;
    let resolved = if candidate > local_now {
        candidate
    } else {
        zone.from_local_datetime(&(today + Duration::days(1)))
            .earliest()?
    };
    Some(resolved.with_timezone(&Utc))
}

/// Resume timestamp for a quota pause: the parsed reset time, or one hour
/// from now when the text is unparseable.
pub fn quota_resume_time(text: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    parse_reset_time(text, now).unwrap_or(now + Duration::minutes(FALLBACK_PAUSE_MINUTES))
}
