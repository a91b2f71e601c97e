//! Canonical forms for the two contact dedup keys.

/// Normalize an email address for dedup: trim and lowercase.
///
/// Returns `None` when the input is empty or not plausibly an address —
/// a `None` key simply opts the contact out of email-based dedup.
pub fn normalize_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.contains('@') {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// Normalize a phone number for dedup: keep a leading `+`, drop every other
/// non-digit (spaces, dashes, dots, parentheses).
///
/// Returns `None` for inputs with fewer than 5 digits; those are too short
/// to identify anyone and would over-merge.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c == '+' && out.is_empty() {
            out.push(c);
        } else if c.is_ascii_digit() {
            out.push(c);
        }
    }

    let digits = out.chars().filter(char::is_ascii_digit).count();
    if digits < 5 { None } else { Some(out) }
}
