//! Phone number normalization to E.164.

use textcast_core::error::{Result, TextcastError};

/// Normalize a human-entered phone number to E.164 (`+<country><number>`).
///
/// Accepts `+CC...`, `00CC...`, and national numbers, which get
/// `default_country_code` prepended. Punctuation (spaces, dashes, dots,
/// parentheses) is ignored. Anything that cannot be made into 8–15 digits is
/// a permanent [`TextcastError::Validation`] failure.
pub fn normalize_phone(raw: &str, default_country_code: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TextcastError::Validation("recipient phone number is empty".into()));
    }

    let mut digits = String::with_capacity(trimmed.len());
    for (i, c) in trimmed.chars().enumerate() {
        match c {
            '0'..='9' => digits.push(c),
            '+' if i == 0 => {}
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => {
                return Err(TextcastError::Validation(format!(
                    "invalid character '{c}' in phone number '{trimmed}'"
                )));
            }
        }
    }

    let international = if trimmed.starts_with('+') {
        digits
    } else if let Some(rest) = digits.strip_prefix("00") {
        rest.to_string()
    } else {
        let cc = default_country_code.trim_start_matches('+');
        // NANP numbers are often typed with the leading trunk "1" already
        if cc == "1" && digits.len() == 11 && digits.starts_with('1') {
            digits
        } else {
            let national = digits.trim_start_matches('0');
            format!("{cc}{national}")
        }
    };

    if !(8..=15).contains(&international.len()) || international.starts_with('0') {
        return Err(TextcastError::Validation(format!(
            "cannot normalize phone number '{trimmed}' to E.164"
        )));
    }

    Ok(format!("+{international}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_international() {
        assert_eq!(normalize_phone("+44 20 7946 0958", "1").unwrap(), "+442079460958");
    }

    #[test]
    fn test_national_gets_default_country() {
        assert_eq!(normalize_phone("(415) 555-0134", "1").unwrap(), "+14155550134");
        assert_eq!(normalize_phone("1-415-555-0134", "1").unwrap(), "+14155550134");
        assert_eq!(normalize_phone("0612345678", "+33").unwrap(), "+33612345678");
    }

    #[test]
    fn test_double_zero_prefix() {
        assert_eq!(normalize_phone("0049 30 1234567", "1").unwrap(), "+49301234567");
    }

    #[test]
    fn test_unusable_numbers_are_validation_errors() {
        for bad in ["", "12", "+1 555 CALL NOW", "+1234567890123456", "++15555550100"] {
            assert!(
                matches!(normalize_phone(bad, "1"), Err(TextcastError::Validation(_))),
                "{bad} should be rejected"
            );
        }
    }
}
