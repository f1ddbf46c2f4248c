//! Classification code string manipulation
//!
//! Pure helpers for working with decimal classification notations: cleaning
//! up user-supplied codes and computing the parent chain of a code without
//! touching the network. Hierarchy here is purely lexical; the authoritative
//! hierarchy lives in the remote scheme's `broader` pointers.

/// Normalizes a classification code.
///
/// Strips characters that cannot appear in a notation, trims trailing zeros
/// from the decimal part (`"025.0400"` becomes `"025.04"`), and normalizes
/// each side of a range notation (`"025.04-025.06"`) independently. An
/// all-zero decimal tail collapses to the integer part.
pub fn normalize(code: &str) -> String {
    let cleaned: String = code
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | ' '))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return String::new();
    }

    if cleaned.contains('-') {
        return cleaned
            .split('-')
            .map(|part| trim_decimal(part.trim()))
            .collect::<Vec<_>>()
            .join("-");
    }
    trim_decimal(cleaned)
}

fn trim_decimal(part: &str) -> String {
    match part.split_once('.') {
        Some((base, decimal)) => {
            let decimal = decimal.trim_end_matches('0');
            if decimal.is_empty() {
                base.to_string()
            } else {
                format!("{base}.{decimal}")
            }
        }
        None => part.to_string(),
    }
}

/// Computes the immediate parent code, or `None` at the top of the scheme.
///
/// With a decimal point the last decimal digit is dropped, and a remainder
/// of only zeros collapses to the integer part (`"025.04"` → `"025"`).
/// Three-digit codes step through the hundreds hierarchy: `"647"` → `"640"`,
/// `"640"` → `"600"`, `"600"` → top. Range notations use the range start.
pub fn parent_code(code: &str) -> Option<String> {
    if code.is_empty() || code == "000" {
        return None;
    }

    let code = match code.split_once('-') {
        Some((start, _)) => start.trim(),
        None => code,
    };
    let normalized = normalize(code);

    if let Some((base, decimal)) = normalized.split_once('.') {
        let trimmed = if decimal.len() > 1 {
            &decimal[..decimal.len() - 1]
        } else {
            ""
        };
        if trimmed.is_empty() || trimmed.chars().all(|c| c == '0') {
            return Some(base.to_string());
        }
        return Some(format!("{base}.{trimmed}"));
    }

    if normalized.len() == 3 {
        if normalized.ends_with("00") {
            return None;
        }
        if normalized.ends_with('0') {
            return Some(format!("{}00", &normalized[..1]));
        }
        return Some(format!("{}0", &normalized[..2]));
    }

    None
}

/// Returns the ancestor codes of `code`, nearest parent first, computed
/// lexically with no remote calls. The chain stops at the top of the scheme,
/// on a repeated code, or at `max_depth` entries.
pub fn ancestor_codes(code: &str, max_depth: usize) -> Vec<String> {
    let mut chain: Vec<String> = Vec::new();
    let mut current = normalize(code);
    while chain.len() < max_depth {
        match parent_code(&current) {
            Some(parent) if !chain.contains(&parent) => {
                current = parent.clone();
                chain.push(parent);
            }
            _ => break,
        }
    }
    chain
}
