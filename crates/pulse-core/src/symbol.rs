//! Symbol canonicalization.
//!
//! Backends disagree on how a pair is spelled: `btc-usd`, `BTC/USDT`,
//! `eth_usdc`, `SOL-PERP`. Every component compares symbols in one form:
//! trimmed, upper-case, with a trailing quote-currency suffix removed.

/// Quote currencies stripped when they follow a separator.
const QUOTE_SUFFIXES: &[&str] = &["USDT", "USDC", "USD", "PERP", "EUR", "BUSD"];

/// Separators that may precede a quote suffix.
const SEPARATORS: &[char] = &['-', '/', '_', ':'];

/// Canonicalize a raw symbol.
///
/// Returns `None` when nothing usable remains (empty input, or a bare quote
/// suffix such as `"-USD"`).
///
/// ```
/// use pulse_core::canonical_symbol;
///
/// assert_eq!(canonical_symbol("btc-usd").as_deref(), Some("BTC"));
/// assert_eq!(canonical_symbol("ETH/USDT").as_deref(), Some("ETH"));
/// assert_eq!(canonical_symbol("  sol ").as_deref(), Some("SOL"));
/// assert_eq!(canonical_symbol(""), None);
/// ```
pub fn canonical_symbol(raw: &str) -> Option<String> {
    let upper = raw.trim().to_uppercase();
    if upper.is_empty() {
        return None;
    }

    let stripped = strip_quote_suffix(&upper);
    let stripped = stripped.trim_end_matches(SEPARATORS).trim();

    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

fn strip_quote_suffix(symbol: &str) -> &str {
    for sep in SEPARATORS {
        if let Some((base, quote)) = symbol.rsplit_once(*sep) {
            if QUOTE_SUFFIXES.contains(&quote) {
                return base;
            }
        }
    }
    symbol
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_known_quote_suffixes() {
        assert_eq!(canonical_symbol("BTC-USD").as_deref(), Some("BTC"));
        assert_eq!(canonical_symbol("btc-usdt").as_deref(), Some("BTC"));
        assert_eq!(canonical_symbol("ETH/USDC").as_deref(), Some("ETH"));
        assert_eq!(canonical_symbol("doge_usd").as_deref(), Some("DOGE"));
        assert_eq!(canonical_symbol("SOL-PERP").as_deref(), Some("SOL"));
    }

    #[test]
    fn test_keeps_unknown_suffix() {
        // Not a quote currency, so the whole pair survives.
        assert_eq!(canonical_symbol("ETH-BTC").as_deref(), Some("ETH-BTC"));
        // No separator: glued pairs are left alone.
        assert_eq!(canonical_symbol("BTCUSDT").as_deref(), Some("BTCUSDT"));
    }

    #[test]
    fn test_empty_and_suffix_only() {
        assert_eq!(canonical_symbol(""), None);
        assert_eq!(canonical_symbol("   "), None);
        assert_eq!(canonical_symbol("-USD"), None);
    }

    #[test]
    fn test_idempotent() {
        let once = canonical_symbol("avax-usd").unwrap();
        assert_eq!(canonical_symbol(&once).as_deref(), Some(once.as_str()));
    }
}
