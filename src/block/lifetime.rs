//! Block-lifetime function (§4.2, design-level): used by conflict
//! resolution context and by the store's eviction sweep to decide how long
//! a block with a given difficulty may live.

use crate::config::Settings;

/// `lifetime(x)` in days, monotonic increasing in difficulty `x` for
/// `d1 < d2`, `c1 < c2`, calibrated by the two `(d, c)` pairs in `Settings`.
pub fn lifetime_days(settings: &Settings, difficulty: u32) -> f64 {
    let x = difficulty as f64;
    let (d1, d2, c1, c2) = (
        settings.lifetime_d1,
        settings.lifetime_d2,
        settings.lifetime_c1,
        settings.lifetime_c2,
    );
    let numerator = (d1 - d2) * x.log2() + d1 * c2.log2() - d2 * c1.log2();
    let denominator = c1.log2() - c2.log2();
    numerator / denominator + settings.lifetime_constant
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifetime_is_monotonic_in_difficulty() {
        let settings = Settings::default();
        let low = lifetime_days(&settings, 8);
        let high = lifetime_days(&settings, 20);
        assert!(high > low);
    }
}
