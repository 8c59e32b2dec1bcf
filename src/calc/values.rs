//! Pure per-row value functions.

use crate::entities::{FringeModel, FringeUnit, MarkupModel, MarkupUnit};

/// Leaf formula: `quantity × rate × multiplier`, treating null as the
/// identity for quantity/multiplier and as 0 for rate.
#[must_use]
pub fn leaf_nominal(quantity: Option<f64>, rate: Option<f64>, multiplier: Option<f64>) -> f64 {
    quantity.unwrap_or(1.0) * rate.unwrap_or(0.0) * multiplier.unwrap_or(1.0)
}

/// Contribution of one fringe applied to a nominal value `v`.
///
/// Flat fringes contribute their rate once. Percent fringes contribute
/// `rate × v`, bounded by the cutoff when one is set. A null rate contributes
/// nothing.
#[must_use]
pub fn one_fringe(v: f64, fringe: &FringeModel) -> f64 {
    let Some(rate) = fringe.rate else {
        return 0.0;
    };
    match fringe.unit {
        FringeUnit::Flat => rate,
        FringeUnit::Percent => {
            let base = fringe.cutoff.map_or(v, |cutoff| v.min(cutoff));
            rate * base
        }
    }
}

/// Total fringe contribution for a row's nominal value.
#[must_use]
pub fn fringe_contribution(v: f64, fringes: &[FringeModel]) -> f64 {
    fringes.iter().map(|f| one_fringe(v, f)).sum()
}

/// Contribution of the percent markups that list a row as a child, applied to
/// that row's nominal value `v`. Non-percent entries and null rates contribute
/// nothing.
#[must_use]
pub fn percent_contribution(v: f64, markups: &[MarkupModel]) -> f64 {
    markups
        .iter()
        .filter(|m| m.unit == MarkupUnit::Percent)
        .filter_map(|m| m.rate)
        .map(|rate| rate * v)
        .sum()
}

/// Total of flat markup rates (applied once each to their parent's
/// accumulated bucket).
#[must_use]
pub fn flat_total(markups: &[MarkupModel]) -> f64 {
    markups
        .iter()
        .filter(|m| m.unit == MarkupUnit::Flat)
        .filter_map(|m| m.rate)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{markup, refs::ParentKind};

    fn fringe(rate: Option<f64>, unit: FringeUnit, cutoff: Option<f64>) -> FringeModel {
        FringeModel {
            id: 0,
            budget_id: 0,
            name: "f".to_string(),
            description: None,
            cutoff,
            rate,
            unit,
            color: None,
            order: "n".to_string(),
        }
    }

    fn markup(rate: Option<f64>, unit: MarkupUnit) -> MarkupModel {
        markup::Model {
            id: 0,
            budget_id: 0,
            parent_kind: ParentKind::Budget,
            parent_id: 0,
            identifier: None,
            description: None,
            rate,
            unit,
            order: "n".to_string(),
        }
    }

    #[test]
    fn leaf_nominal_treats_nulls_as_identities() {
        assert_eq!(leaf_nominal(Some(2.0), Some(50.0), Some(2.0)), 200.0);
        assert_eq!(leaf_nominal(None, Some(10.0), None), 10.0);
        assert_eq!(leaf_nominal(Some(3.0), None, Some(4.0)), 0.0);
    }

    #[test]
    fn percent_fringe_respects_cutoff_only_above_it() {
        let f = fringe(Some(0.1), FringeUnit::Percent, Some(50.0));
        // Below the cutoff the full value applies
        assert!((one_fringe(10.0, &f) - 1.0).abs() < f64::EPSILON);
        // Above the cutoff the contribution is bounded
        assert!((one_fringe(200.0, &f) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flat_fringe_ignores_value_and_cutoff() {
        let f = fringe(Some(25.0), FringeUnit::Flat, Some(1.0));
        assert!((one_fringe(0.0, &f) - 25.0).abs() < f64::EPSILON);
        assert!((one_fringe(1e6, &f) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn null_rate_contributes_zero() {
        let f = fringe(None, FringeUnit::Percent, None);
        assert_eq!(one_fringe(100.0, &f), 0.0);
        assert_eq!(percent_contribution(100.0, &[markup(None, MarkupUnit::Percent)]), 0.0);
    }

    #[test]
    fn percent_contribution_ignores_flat_markups() {
        let markups = vec![
            markup(Some(0.5), MarkupUnit::Percent),
            markup(Some(100.0), MarkupUnit::Flat),
        ];
        assert!((percent_contribution(210.0, &markups) - 105.0).abs() < f64::EPSILON);
        assert!((flat_total(&markups) - 100.0).abs() < f64::EPSILON);
    }
}
