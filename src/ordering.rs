//! Fractional order keys for row tables.
//!
//! Rows carry a string key over the alphabet `a-z`, compared lexicographically
//! and treated as a fraction in base 26. Inserting between any two neighbors is
//! O(1) writes: [`midpoint`] always finds a key strictly between them because
//! the domain is dense. A valid key is non-empty, alphabetic, and never ends in
//! `a` (the lowest digit), so there is always room below any key.

use crate::errors::{Error, Result};

const BASE: u16 = 26;
const LOWEST: u8 = b'a';

/// Validates an order key: non-empty, `a-z` only, not ending in `a`.
pub fn validate_order_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidOrderKey {
            key: key.to_string(),
            message: "key is empty".to_string(),
        });
    }
    if !key.bytes().all(|b| b.is_ascii_lowercase()) {
        return Err(Error::InvalidOrderKey {
            key: key.to_string(),
            message: "key must contain only characters a-z".to_string(),
        });
    }
    if key.ends_with('a') {
        return Err(Error::InvalidOrderKey {
            key: key.to_string(),
            message: "key must not end in the lowest character".to_string(),
        });
    }
    Ok(())
}

/// Returns a key strictly between `lower` and `upper`.
///
/// Either endpoint may be omitted: with no `lower` the result sorts before
/// `upper`, with no `upper` it sorts after `lower`, and with neither it is the
/// middle of the whole domain. Errors if a supplied endpoint is invalid or the
/// endpoints are not in strict order.
pub fn midpoint(lower: Option<&str>, upper: Option<&str>) -> Result<String> {
    if let Some(lo) = lower {
        validate_order_key(lo)?;
    }
    if let Some(up) = upper {
        validate_order_key(up)?;
    }
    let lo = lower.unwrap_or("");
    let up = upper.unwrap_or("");
    if !up.is_empty() && lo >= up {
        return Err(Error::InvalidOrderKey {
            key: lo.to_string(),
            message: format!("lower bound is not strictly below upper bound '{up}'"),
        });
    }
    Ok(between(lo.as_bytes(), up.as_bytes()))
}

/// Core recursion over raw digit strings. `a` may be empty (negative
/// infinity); `b` may be empty (positive infinity). Requires `a < b` when both
/// are present; the result never ends in the lowest digit.
fn between(a: &[u8], b: &[u8]) -> String {
    let mut out = Vec::with_capacity(b.len().max(a.len()) + 1);
    let mut a = a;
    let mut b = b;

    loop {
        // Consume the shared prefix, treating an exhausted `a` as a run of
        // lowest digits when `b` continues with them.
        let mut i = 0;
        while i < b.len() {
            let da = a.get(i).copied().unwrap_or(LOWEST);
            if da == b[i] {
                out.push(da);
                i += 1;
            } else {
                break;
            }
        }

        let da = a.get(i).map_or(0, |c| u16::from(c - LOWEST));
        let db = b.get(i).map_or(BASE, |c| u16::from(c - LOWEST));

        if db - da > 1 {
            // Room at this digit: the upper-rounded middle sits strictly
            // between the bounds and is > da >= 0, so the key cannot end in
            // the lowest character.
            let mid = (da + db + 1) / 2;
            out.push(LOWEST + u8::try_from(mid).unwrap_or(0));
            return String::from_utf8(out).unwrap_or_default();
        }

        // Adjacent digits. When the upper bound keeps going past this digit,
        // its truncation is already strictly between the bounds (a valid
        // upper never continues with only lowest digits).
        if b.len() > i + 1 {
            out.push(b[i]);
            return String::from_utf8(out).unwrap_or_default();
        }

        // Keep the lower digit and find a key strictly above the remainder
        // of `a`, unbounded from above.
        out.push(LOWEST + u8::try_from(da).unwrap_or(0));
        a = if i + 1 <= a.len() { &a[i + 1..] } else { &[] };
        b = &[];
    }
}

/// Returns `n` keys in ascending order, suitable for initial bulk insertion
/// after `current_max` (or from scratch when `current_max` is `None`).
pub fn order_after(n: usize, current_max: Option<&str>) -> Result<Vec<String>> {
    let mut keys = Vec::with_capacity(n);
    let mut prev = current_max.map(str::to_string);
    for _ in 0..n {
        let next = midpoint(prev.as_deref(), None)?;
        prev = Some(next.clone());
        keys.push(next);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_between(lower: Option<&str>, upper: Option<&str>) -> String {
        let mid = midpoint(lower, upper).unwrap();
        validate_order_key(&mid).unwrap();
        if let Some(lo) = lower {
            assert!(lo < mid.as_str(), "{lo} !< {mid}");
        }
        if let Some(up) = upper {
            assert!(mid.as_str() < up, "{mid} !< {up}");
        }
        mid
    }

    #[test]
    fn midpoint_with_no_endpoints_is_middle_of_domain() {
        assert_eq!(midpoint(None, None).unwrap(), "n");
    }

    #[test]
    fn midpoint_between_simple_neighbors() {
        assert_between(Some("b"), Some("d"));
        assert_between(Some("ab"), Some("b"));
        assert_between(None, Some("b"));
        assert_between(Some("z"), None);
        assert_between(Some("ab"), Some("ac"));
        assert_between(None, Some("ab"));
    }

    #[test]
    fn repeated_insertion_at_one_point_grows_logarithmically() {
        // Squeeze 64 keys between the same two neighbors; every insertion must
        // succeed and the key length stays modest.
        let lower = "b".to_string();
        let mut upper = "c".to_string();
        for _ in 0..64 {
            upper = assert_between(Some(&lower), Some(&upper));
        }
        assert!(upper.len() <= 16, "key grew too fast: {upper}");
    }

    #[test]
    fn repeated_append_stays_ordered() {
        let mut prev = midpoint(None, None).unwrap();
        for _ in 0..64 {
            let next = assert_between(Some(&prev), None);
            prev = next;
        }
    }

    #[test]
    fn order_after_returns_ascending_keys() {
        let keys = order_after(8, None).unwrap();
        assert_eq!(keys.len(), 8);
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for key in &keys {
            validate_order_key(key).unwrap();
        }

        let more = order_after(3, Some(keys.last().unwrap())).unwrap();
        assert!(keys.last().unwrap() < &more[0]);
    }

    #[test]
    fn validation_rejects_bad_keys() {
        assert!(validate_order_key("").is_err());
        assert!(validate_order_key("abc1").is_err());
        assert!(validate_order_key("Abc").is_err());
        assert!(validate_order_key("ba").is_err());
        assert!(validate_order_key("n").is_ok());
    }

    #[test]
    fn midpoint_rejects_out_of_order_endpoints() {
        assert!(midpoint(Some("d"), Some("b")).is_err());
        assert!(midpoint(Some("b"), Some("b")).is_err());
    }
}
