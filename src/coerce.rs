//! Column coercions.
//!
//! A mapping's coercion string (`trim|lower|boolean`) is parsed once into a
//! [`CoercionPipeline`]: an ordered list of rules looked up in a fixed
//! registry of named functions. Each rule takes the running [`CellValue`] and
//! either returns a replacement or `None`, which leaves the value as it was.
//! That is how "unparsable leaves the prior value unchanged" is expressed for
//! every rule at once. Unknown rule names are skipped.

use std::{fmt, sync::OnceLock};

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc,
};
use log::debug;
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Text(String),
    Boolean(bool),
    Numeric(f64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Text as written to the intermediate CSV; `Null` renders empty.
    pub fn render(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Text(s) => s.clone(),
            CellValue::Boolean(b) => b.to_string(),
            CellValue::Numeric(n) => n.to_string(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            CellValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, false),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

type RuleFn = fn(&CellValue) -> Option<CellValue>;

const RULES: &[(&str, RuleFn)] = &[
    ("trim", trim),
    ("lower", lower),
    ("boolean", boolean),
    ("date", date),
    ("timestamptz", timestamptz),
    ("numeric", numeric),
];

pub fn rule_names() -> impl Iterator<Item = &'static str> {
    RULES.iter().map(|(name, _)| *name)
}

fn lookup(name: &str) -> Option<RuleFn> {
    RULES
        .iter()
        .find(|(rule, _)| *rule == name)
        .map(|(_, func)| *func)
}

#[derive(Clone, Default)]
pub struct CoercionPipeline {
    rules: Vec<(&'static str, RuleFn)>,
}

impl fmt::Debug for CoercionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|(name, _)| name))
            .finish()
    }
}

impl CoercionPipeline {
    pub fn parse(spec: &str) -> Self {
        let mut rules = Vec::new();
        for token in spec.split('|').map(str::trim).filter(|t| !t.is_empty()) {
            match RULES.iter().find(|(name, _)| *name == token) {
                Some((name, func)) => rules.push((*name, *func)),
                None => debug!("Ignoring unknown coercion rule '{token}'"),
            }
        }
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|(name, _)| *name).collect()
    }

    pub fn apply(&self, raw: &str) -> CellValue {
        let mut value = CellValue::Text(raw.to_string());
        for (_, rule) in &self.rules {
            if let Some(next) = rule(&value) {
                value = next;
            }
        }
        value
    }
}

/// Applies a single named rule; `None` for names outside the registry.
pub fn apply_rule(name: &str, value: &CellValue) -> Option<CellValue> {
    lookup(name).map(|rule| rule(value).unwrap_or_else(|| value.clone()))
}

fn text_of(value: &CellValue) -> Option<String> {
    match value {
        CellValue::Null => None,
        CellValue::Text(s) => Some(s.clone()),
        other => Some(other.render()),
    }
}

fn trim(value: &CellValue) -> Option<CellValue> {
    let text = text_of(value)?;
    Some(CellValue::Text(text.trim().to_string()))
}

fn lower(value: &CellValue) -> Option<CellValue> {
    let text = text_of(value)?;
    Some(CellValue::Text(text.to_lowercase()))
}

fn boolean(value: &CellValue) -> Option<CellValue> {
    if let CellValue::Boolean(_) = value {
        return None;
    }
    let text = text_of(value)?;
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "t" | "y" => Some(CellValue::Boolean(true)),
        "false" | "no" | "0" | "f" | "n" => Some(CellValue::Boolean(false)),
        _ => None,
    }
}

fn date(value: &CellValue) -> Option<CellValue> {
    match value {
        CellValue::Date(_) => None,
        CellValue::Timestamp(ts) => Some(CellValue::Date(ts.date_naive())),
        CellValue::Text(text) => parse_flexible(text).map(|parsed| CellValue::Date(parsed.date())),
        _ => None,
    }
}

fn timestamptz(value: &CellValue) -> Option<CellValue> {
    match value {
        CellValue::Timestamp(_) => None,
        CellValue::Date(d) => Some(CellValue::Timestamp(midnight_utc(*d))),
        CellValue::Text(text) => parse_flexible(text).map(|parsed| CellValue::Timestamp(parsed.into_timestamp())),
        _ => None,
    }
}

fn currency_noise() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[$,\s]").expect("currency pattern is valid"))
}

fn numeric(value: &CellValue) -> Option<CellValue> {
    match value {
        CellValue::Numeric(_) => None,
        CellValue::Text(text) => {
            let cleaned = currency_noise().replace_all(text, "");
            let parsed: f64 = cleaned.parse().ok()?;
            parsed.is_finite().then_some(CellValue::Numeric(parsed))
        }
        _ => None,
    }
}

/// Result of a lenient date/time parse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParsedTemporal {
    Date(NaiveDate),
    Naive(NaiveDateTime),
    Zoned(DateTime<FixedOffset>),
}

impl ParsedTemporal {
    pub fn date(&self) -> NaiveDate {
        match self {
            ParsedTemporal::Date(d) => *d,
            ParsedTemporal::Naive(dt) => dt.date(),
            ParsedTemporal::Zoned(dt) => dt.date_naive(),
        }
    }

    /// Naive values are taken to be UTC.
    pub fn into_timestamp(self) -> DateTime<FixedOffset> {
        match self {
            ParsedTemporal::Date(d) => midnight_utc(d),
            ParsedTemporal::Naive(dt) => Utc.from_utc_datetime(&dt).fixed_offset(),
            ParsedTemporal::Zoned(dt) => dt,
        }
    }
}

fn midnight_utc(date: NaiveDate) -> DateTime<FixedOffset> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
        .fixed_offset()
}

// Month-first before day-first: the CRM exports US-formatted dates. Two-digit
// years come before four-digit ones because `%Y` would read "24" as year 24.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%y",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%m-%d-%Y",
    "%d-%m-%Y",
    "%d-%b-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
    "%B %d %Y",
    "%d %b %Y",
    "%d %B %Y",
    "%Y%m%d",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%y %H:%M",
    "%m/%d/%y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%b %d, %Y %I:%M %p",
    "%B %d, %Y %I:%M %p",
];

const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%m/%d/%Y %H:%M:%S %z",
    "%m/%d/%Y %I:%M %p %z",
];

/// Parses the date and timestamp shapes seen in CRM exports.
pub fn parse_flexible(value: &str) -> Option<ParsedTemporal> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ParsedTemporal::Zoned(parsed));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(ParsedTemporal::Zoned(parsed));
    }
    let utc_suffixed = trimmed
        .strip_suffix(" UTC")
        .or_else(|| trimmed.strip_suffix('Z'));
    for fmt in ZONED_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(trimmed, fmt) {
            return Some(ParsedTemporal::Zoned(parsed));
        }
    }
    if let Some(naive_part) = utc_suffixed {
        for fmt in DATETIME_FORMATS {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(naive_part.trim_end(), fmt) {
                return Some(ParsedTemporal::Zoned(Utc.from_utc_datetime(&parsed).fixed_offset()));
            }
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(ParsedTemporal::Naive(parsed));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(ParsedTemporal::Date(parsed));
        }
    }
    None
}
