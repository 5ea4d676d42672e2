// Spread computation and the per-token observation model. One observation
// is one cycle's snapshot for one token across every source that answered.

use serde::Serialize;
use std::collections::BTreeMap;

/// Emitted per-DEX blocks must stay inside this band (plausibility bound,
/// shared with the aggregator filter).
const MAX_PLAUSIBLE_PRICE: f64 = 1_000_000.0;

/// One DEX's view for a token: its price and both spreads against the CEX.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DexSpread {
    pub direct: Option<f64>,
    pub reverse: Option<f64>,
    pub dex_price: f64,
    pub cex_bid: Option<f64>,
    pub cex_ask: Option<f64>,
}

/// One cycle's snapshot for one token. Serializes to the wire shape sent
/// to subscribers and expanded into history rows.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Observation {
    pub token_name: String,
    /// (bid, ask) from the futures ticker; either side may be absent.
    pub mexc_price: (Option<f64>, Option<f64>),
    /// Minimum order notional on the CEX side, when lot metadata is known.
    pub mexc_limit: Option<f64>,
    pub spreads: BTreeMap<String, DexSpread>,
    /// Unix seconds.
    pub timestamp: f64,
}

/// Direct and reverse spread in percent. Both are null when the DEX price
/// is unusable; each side is null when its CEX side is missing.
pub fn calc_spread(
    cex_bid: Option<f64>,
    cex_ask: Option<f64>,
    dex_price: f64,
) -> (Option<f64>, Option<f64>) {
    if dex_price <= 0.0 {
        return (None, None);
    }
    let direct = match cex_bid {
        Some(bid) if bid > 0.0 => Some((bid - dex_price) / dex_price * 100.0),
        _ => None,
    };
    let reverse = match cex_ask {
        Some(ask) if ask > 0.0 => Some((dex_price - ask) / ask * 100.0),
        _ => None,
    };
    (direct, reverse)
}

/// Reference price for lot-size math: the mid when both sides are present,
/// else whichever side exists.
pub fn reference_price(cex_bid: Option<f64>, cex_ask: Option<f64>) -> Option<f64> {
    match (cex_bid, cex_ask) {
        (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
        (Some(bid), None) => Some(bid),
        (None, Some(ask)) => Some(ask),
        (None, None) => None,
    }
}

/// Assemble an observation from the CEX sides and the post-filter DEX
/// prices. Blocks outside the plausibility band are dropped here so no
/// downstream consumer ever sees them.
pub fn build_observation(
    token_name: &str,
    cex_bid: Option<f64>,
    cex_ask: Option<f64>,
    mexc_limit: Option<f64>,
    dex_prices: &[(&str, f64)],
    timestamp: f64,
) -> Observation {
    let mut spreads = BTreeMap::new();
    for (dex, price) in dex_prices {
        let price = *price;
        if price <= 0.0 || price >= MAX_PLAUSIBLE_PRICE {
            continue;
        }
        let (direct, reverse) = calc_spread(cex_bid, cex_ask, price);
        spreads.insert(
            dex.to_string(),
            DexSpread {
                direct,
                reverse,
                dex_price: price,
                cex_bid,
                cex_ask,
            },
        );
    }
    Observation {
        token_name: token_name.to_string(),
        mexc_price: (cex_bid, cex_ask),
        mexc_limit,
        spreads,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_spread_both_sides() {
        let (direct, reverse) = calc_spread(Some(1.00), Some(1.02), 1.015);
        let d = direct.unwrap();
        let r = reverse.unwrap();
        assert!((d - (1.00 - 1.015) / 1.015 * 100.0).abs() < 1e-9);
        assert!((r - (1.015 - 1.02) / 1.02 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_calc_spread_missing_sides() {
        assert_eq!(calc_spread(None, Some(1.02), 1.0).0, None);
        assert_eq!(calc_spread(Some(1.0), None, 1.0).1, None);
        assert_eq!(calc_spread(Some(0.0), Some(0.0), 1.0), (None, None));
        // Unusable DEX price nulls both spreads.
        assert_eq!(calc_spread(Some(1.0), Some(1.02), 0.0), (None, None));
        assert_eq!(calc_spread(Some(1.0), Some(1.02), -2.0), (None, None));
    }

    #[test]
    fn test_reference_price() {
        assert_eq!(reference_price(Some(1.0), Some(1.02)), Some(1.01));
        assert_eq!(reference_price(Some(1.0), None), Some(1.0));
        assert_eq!(reference_price(None, Some(1.02)), Some(1.02));
        assert_eq!(reference_price(None, None), None);
    }

    #[test]
    fn test_build_observation_drops_implausible_blocks() {
        let obs = build_observation(
            "FOO-USDT",
            Some(1.00),
            Some(1.02),
            None,
            &[
                ("jupiter", 1.015),
                ("pancake", 0.0),
                ("matcha", 2_000_000.0),
            ],
            1_000.0,
        );
        assert_eq!(obs.spreads.len(), 1);
        assert!(obs.spreads.contains_key("jupiter"));
    }

    #[test]
    fn test_build_observation_cex_absent_keeps_blocks_with_null_spreads() {
        let obs = build_observation("FOO-USDT", None, None, None, &[("pancake", 3.5)], 1_000.0);
        assert_eq!(obs.mexc_price, (None, None));
        let block = &obs.spreads["pancake"];
        assert_eq!(block.direct, None);
        assert_eq!(block.reverse, None);
        assert_eq!(block.dex_price, 3.5);
    }

    #[test]
    fn test_observation_wire_shape() {
        let obs = build_observation(
            "FOO-USDT",
            Some(1.00),
            None,
            Some(25.0),
            &[("jupiter", 2.0)],
            1_234.0,
        );
        let json = serde_json::to_value(&obs).unwrap();
        assert_eq!(json["token_name"], "FOO-USDT");
        assert_eq!(json["mexc_price"][0], 1.00);
        assert_eq!(json["mexc_price"][1], serde_json::Value::Null);
        assert_eq!(json["mexc_limit"], 25.0);
        assert_eq!(json["timestamp"], 1_234.0);
        assert_eq!(json["spreads"]["jupiter"]["dex_price"], 2.0);
        assert_eq!(
            json["spreads"]["jupiter"]["reverse"],
            serde_json::Value::Null
        );
    }

    #[test]
    fn test_identical_inputs_identical_observation_modulo_timestamp() {
        let build = |ts| {
            build_observation(
                "FOO-USDT",
                Some(1.00),
                Some(1.02),
                Some(10.0),
                &[("jupiter", 1.015), ("pancake", 1.013)],
                ts,
            )
        };
        let mut a = build(1.0);
        let b = build(2.0);
        a.timestamp = b.timestamp;
        assert_eq!(a, b);
    }
}
