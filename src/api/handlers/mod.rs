//! API handlers and shared validation helpers.

pub mod auth;
pub mod chat;
pub mod contacts;
pub mod health;
pub mod registration;
pub mod root;
pub mod users;

use regex::Regex;

/// Lightweight email sanity check used before persisting or mailing anything.
pub fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email))
}

/// Emails are compared trimmed and lowercased everywhere.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Calendar date in `YYYY-MM-DD` form.
pub fn valid_date(value: &str) -> bool {
    let Ok(re) = Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$") else {
        return false;
    };
    let Some(caps) = re.captures(value) else {
        return false;
    };
    let (Ok(year), Ok(month), Ok(day)) = (
        caps[1].parse::<u32>(),
        caps[2].parse::<u32>(),
        caps[3].parse::<u32>(),
    ) else {
        return false;
    };

    let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
    let days_in_month = match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if leap => 29,
        2 => 28,
        _ => return false,
    };

    year >= 1 && (1..=days_in_month).contains(&day)
}

/// Trim optional text, treating blank strings as absent.
pub(crate) fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parse a numeric path id.
pub(crate) fn parse_id(id: &str) -> Option<i64> {
    id.trim().parse::<i64>().ok().filter(|id| *id > 0)
}
