//! Follower volume sizing.
//!
//! The follower's volume is the master's scaled by the per-follow copy
//! percentage, optionally capped by the follower's risk budget when a cached
//! account equity is available.

use rust_decimal::Decimal;

/// Smallest broker lot increment we will dispatch.
pub fn min_volume() -> Decimal {
    Decimal::new(1, 2)
}

/// Compute the volume to mirror for one follower.
pub fn compute_follower_volume(
    master_volume: Decimal,
    copy_percentage: Decimal,
    max_risk_per_trade: Decimal,
    equity: Option<Decimal>,
    open_price: Decimal,
) -> Decimal {
    let hundred = Decimal::new(100, 0);
    let mut volume = (master_volume * copy_percentage / hundred).round_dp(2);

    if let Some(equity) = equity.filter(|e| *e > Decimal::ZERO) {
        if open_price > Decimal::ZERO {
            let risk_notional = equity * max_risk_per_trade / hundred;
            let risk_cap = (risk_notional / open_price).round_dp(2);
            volume = volume.min(risk_cap);
        }
    }

    volume.max(min_volume())
}

/// Ratio of follower volume to master volume, recorded on the ledger.
pub fn copy_ratio(follower_volume: Decimal, master_volume: Decimal) -> Decimal {
    if master_volume <= Decimal::ZERO {
        return Decimal::ONE;
    }
    (follower_volume / master_volume).round_dp(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_full_copy_keeps_master_volume() {
        let volume =
            compute_follower_volume(dec("0.10"), dec("100"), dec("2.0"), None, dec("1.10"));
        assert_eq!(volume, dec("0.10"));
    }

    #[test]
    fn test_percentage_scales_volume() {
        let volume = compute_follower_volume(dec("1.00"), dec("25"), dec("2.0"), None, dec("1.10"));
        assert_eq!(volume, dec("0.25"));
    }

    #[test]
    fn test_equity_risk_cap_applies() {
        // 1000 equity at 2% risk = 20 notional; at price 100 that caps at 0.20 lots.
        let volume = compute_follower_volume(
            dec("5.00"),
            dec("100"),
            dec("2.0"),
            Some(dec("1000")),
            dec("100"),
        );
        assert_eq!(volume, dec("0.20"));
    }

    #[test]
    fn test_risk_cap_ignored_without_equity() {
        let volume =
            compute_follower_volume(dec("5.00"), dec("100"), dec("2.0"), None, dec("100"));
        assert_eq!(volume, dec("5.00"));
    }

    #[test]
    fn test_volume_floor() {
        let volume = compute_follower_volume(dec("0.01"), dec("10"), dec("2.0"), None, dec("1.0"));
        assert_eq!(volume, min_volume());
    }

    #[test]
    fn test_copy_ratio() {
        assert_eq!(copy_ratio(dec("0.05"), dec("0.10")), dec("0.5000"));
        assert_eq!(copy_ratio(dec("0.10"), dec("0.10")), dec("1.0000"));
        assert_eq!(copy_ratio(dec("0.10"), Decimal::ZERO), Decimal::ONE);
    }
}
