//! Accept-Encoding negotiation.

/// Whether an `Accept-Encoding` value advertises the given coding. The
/// value is a comma-separated list; `q=` weights are ignored (a listed
/// coding counts as accepted).
pub fn accepts_encoding(value: &str, coding: &str) -> bool {
    value.split(',').any(|entry| {
        let name = entry.split(';').next().unwrap_or("").trim();
        name.eq_ignore_ascii_case(coding)
    })
}
