//! Refund valuation
//!
//! Refunds are a function of how much of an instance's paid lifetime has
//! elapsed. A piecewise-linear curve takes precedence; without one, tiered
//! full/prorate/no-refund thresholds apply. When the lifetime is unknown the
//! thresholds are compared against the instance's raw age instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One point of the refund curve: at `percent` of elapsed lifetime, refund `ratio` of the base
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefundCurvePoint {
    pub percent: f64,
    pub ratio: f64,
}

/// Operator-configured refund policy
///
/// Hour thresholds override day thresholds when greater than zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefundPolicy {
    pub full_hours: i64,
    pub full_days: i64,
    pub prorate_hours: i64,
    pub prorate_days: i64,
    pub no_refund_hours: i64,
    pub no_refund_days: i64,
    pub curve: Vec<RefundCurvePoint>,
    pub require_approval: bool,
    pub auto_refund_on_delete: bool,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            full_hours: 0,
            full_days: 1,
            prorate_hours: 0,
            prorate_days: 7,
            no_refund_hours: 0,
            no_refund_days: 0,
            curve: Vec::new(),
            require_approval: true,
            auto_refund_on_delete: false,
        }
    }
}

impl RefundPolicy {
    pub fn full_threshold_hours(&self) -> f64 {
        effective_hours(self.full_hours, self.full_days)
    }

    pub fn prorate_threshold_hours(&self) -> f64 {
        effective_hours(self.prorate_hours, self.prorate_days)
    }

    pub fn no_refund_threshold_hours(&self) -> f64 {
        effective_hours(self.no_refund_hours, self.no_refund_days)
    }

    /// Curve points deduplicated by percent (last wins) and sorted ascending
    pub fn normalized_curve(&self) -> Vec<RefundCurvePoint> {
        normalize_curve(&self.curve)
    }

    pub fn validate(&self) -> Result<(), String> {
        for point in &self.curve {
            if !point.percent.is_finite() || point.percent < 0.0 {
                return Err(format!("curve percent must be >= 0, got {}", point.percent));
            }
            if !point.ratio.is_finite() || !(0.0..=1.0).contains(&point.ratio) {
                return Err(format!("curve ratio must be within [0, 1], got {}", point.ratio));
            }
        }
        let negatives = [
            self.full_hours,
            self.full_days,
            self.prorate_hours,
            self.prorate_days,
            self.no_refund_hours,
            self.no_refund_days,
        ];
        if negatives.iter().any(|v| *v < 0) {
            return Err("refund thresholds must not be negative".to_string());
        }
        Ok(())
    }
}

/// The lifetime facts a refund is computed from
#[derive(Debug, Clone, PartialEq)]
pub struct RefundSubject {
    pub created_at: Option<DateTime<Utc>>,
    pub expire_at: Option<DateTime<Utc>>,
    /// Instance monthly price in minor units; preferred when positive
    pub monthly_price: i64,
    /// Amount of the order item that created the instance
    pub order_item_amount: i64,
}

/// Which rule produced a quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundRule {
    Expired,
    Curve,
    Tiered,
    AgeFallback,
    NoBasis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundQuote {
    pub amount: i64,
    pub base_amount: i64,
    pub elapsed_ratio: Option<f64>,
    pub rule: RefundRule,
}

fn effective_hours(hours: i64, days: i64) -> f64 {
    if hours > 0 {
        hours as f64
    } else if days > 0 {
        (days * 24) as f64
    } else {
        0.0
    }
}

fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Threshold expressed as a fraction of the total lifetime
pub fn threshold_to_ratio(hours: i64, days: i64, total_hours: f64) -> f64 {
    let threshold = effective_hours(hours, days);
    if threshold <= 0.0 || total_hours <= 0.0 {
        return 0.0;
    }
    clamp01(threshold / total_hours)
}

pub fn normalize_curve(points: &[RefundCurvePoint]) -> Vec<RefundCurvePoint> {
    let mut out: Vec<RefundCurvePoint> = Vec::with_capacity(points.len());
    for point in points {
        if !point.percent.is_finite() || point.percent < 0.0 || !point.ratio.is_finite() {
            continue;
        }
        let point = RefundCurvePoint {
            percent: point.percent,
            ratio: clamp01(point.ratio),
        };
        match out.iter_mut().find(|p| p.percent == point.percent) {
            Some(existing) => existing.ratio = point.ratio,
            None => out.push(point),
        }
    }
    out.sort_by(|a, b| a.percent.total_cmp(&b.percent));
    out
}

/// Evaluate a normalized curve at `percent`, clamping outside the listed range
pub fn evaluate_curve(points: &[RefundCurvePoint], percent: f64) -> Option<f64> {
    let first = points.first()?;
    let last = points.last()?;
    if percent <= first.percent {
        return Some(first.ratio);
    }
    if percent >= last.percent {
        return Some(last.ratio);
    }
    for pair in points.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if percent >= lo.percent && percent <= hi.percent {
            let span = hi.percent - lo.percent;
            if span <= 0.0 {
                return Some(hi.ratio);
            }
            let t = (percent - lo.percent) / span;
            return Some(lo.ratio + (hi.ratio - lo.ratio) * t);
        }
    }
    Some(last.ratio)
}

fn round_amount(base: i64, ratio: f64) -> i64 {
    (base as f64 * ratio).round() as i64
}

/// Compute the refund for `subject` at `now`
pub fn quote_refund(policy: &RefundPolicy, subject: &RefundSubject, now: DateTime<Utc>) -> RefundQuote {
    let base_amount = if subject.monthly_price > 0 {
        subject.monthly_price
    } else {
        subject.order_item_amount.max(0)
    };
    let quote = |amount: i64, elapsed_ratio: Option<f64>, rule: RefundRule| RefundQuote {
        amount: amount.clamp(0, base_amount),
        base_amount,
        elapsed_ratio,
        rule,
    };

    if let Some(expire_at) = subject.expire_at {
        if expire_at < now {
            return quote(0, Some(1.0), RefundRule::Expired);
        }
    }

    if let (Some(created_at), Some(expire_at)) = (subject.created_at, subject.expire_at) {
        let total_secs = (expire_at - created_at).num_seconds();
        if total_secs > 0 {
            let elapsed = clamp01((now - created_at).num_seconds() as f64 / total_secs as f64);

            let curve = policy.normalized_curve();
            if let Some(ratio) = evaluate_curve(&curve, elapsed * 100.0) {
                return quote(round_amount(base_amount, ratio), Some(elapsed), RefundRule::Curve);
            }

            let total_hours = total_secs as f64 / 3600.0;
            let full = threshold_to_ratio(policy.full_hours, policy.full_days, total_hours);
            let prorate = threshold_to_ratio(policy.prorate_hours, policy.prorate_days, total_hours);
            let no_refund =
                threshold_to_ratio(policy.no_refund_hours, policy.no_refund_days, total_hours);
            let amount = tiered(base_amount, elapsed, full, prorate, no_refund);
            return quote(amount, Some(elapsed), RefundRule::Tiered);
        }
    }

    match subject.created_at {
        Some(created_at) => {
            let age_hours = ((now - created_at).num_seconds() as f64 / 3600.0).max(0.0);
            let amount = tiered(
                base_amount,
                age_hours,
                policy.full_threshold_hours(),
                policy.prorate_threshold_hours(),
                policy.no_refund_threshold_hours(),
            );
            quote(amount, None, RefundRule::AgeFallback)
        }
        None => quote(0, None, RefundRule::NoBasis),
    }
}

/// Shared tier rule; `position` and thresholds are in the same unit
fn tiered(base: i64, position: f64, full: f64, prorate: f64, no_refund: f64) -> i64 {
    if no_refund > 0.0 && position > no_refund {
        return 0;
    }
    if position <= full {
        return base;
    }
    if prorate > 0.0 && position <= prorate {
        return round_amount(base, (prorate - position) / prorate);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pt(percent: f64, ratio: f64) -> RefundCurvePoint {
        RefundCurvePoint { percent, ratio }
    }

    fn subject(now: DateTime<Utc>, created_h: i64, expire_h: i64, price: i64) -> RefundSubject {
        RefundSubject {
            created_at: Some(now - Duration::hours(created_h)),
            expire_at: Some(now + Duration::hours(expire_h)),
            monthly_price: price,
            order_item_amount: 0,
        }
    }

    #[test]
    fn curve_at_half_elapsed_refunds_half() {
        let now = Utc::now();
        let policy = RefundPolicy {
            curve: vec![pt(0.0, 1.0), pt(50.0, 0.5), pt(100.0, 0.0)],
            ..Default::default()
        };
        let q = quote_refund(&policy, &subject(now, 100, 100, 3000), now);
        assert_eq!(q.rule, RefundRule::Curve);
        assert_eq!(q.amount, 1500);
    }

    #[test]
    fn curve_clamps_outside_range_and_hits_points() {
        let curve = normalize_curve(&[pt(20.0, 0.8), pt(80.0, 0.2)]);
        assert_eq!(evaluate_curve(&curve, 0.0), Some(0.8));
        assert_eq!(evaluate_curve(&curve, 100.0), Some(0.2));
        assert_eq!(evaluate_curve(&curve, 20.0), Some(0.8));
        assert_eq!(evaluate_curve(&curve, 80.0), Some(0.2));
        let a = evaluate_curve(&curve, 30.0).unwrap();
        let b = evaluate_curve(&curve, 60.0).unwrap();
        assert!(a > b, "decreasing curve must be strictly decreasing between points");
        assert!((evaluate_curve(&curve, 50.0).unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(evaluate_curve(&[], 10.0), None);
    }

    #[test]
    fn curve_dedup_keeps_last_and_sorts() {
        let curve = normalize_curve(&[pt(100.0, 0.0), pt(0.0, 1.0), pt(0.0, 0.9), pt(-5.0, 1.0)]);
        assert_eq!(curve, vec![pt(0.0, 0.9), pt(100.0, 0.0)]);
    }

    #[test]
    fn expired_instance_gets_nothing() {
        let now = Utc::now();
        let s = RefundSubject {
            created_at: Some(now - Duration::days(40)),
            expire_at: Some(now - Duration::days(10)),
            monthly_price: 3000,
            order_item_amount: 0,
        };
        let q = quote_refund(&RefundPolicy::default(), &s, now);
        assert_eq!(q.rule, RefundRule::Expired);
        assert_eq!(q.amount, 0);
    }

    #[test]
    fn tiered_full_prorate_and_none() {
        let now = Utc::now();
        // 30 day lifetime; full within 1 day, prorate within 15 days.
        let policy = RefundPolicy {
            full_days: 1,
            prorate_days: 15,
            ..Default::default()
        };
        let full = quote_refund(&policy, &subject(now, 12, 30 * 24 - 12, 3000), now);
        assert_eq!((full.rule, full.amount), (RefundRule::Tiered, 3000));

        // Elapsed 6 of 30 days = 0.2; prorate ratio 0.5 -> (0.5 - 0.2) / 0.5 = 0.6
        let partial = quote_refund(&policy, &subject(now, 6 * 24, 24 * 24, 3000), now);
        assert_eq!(partial.amount, 1800);

        let late = quote_refund(&policy, &subject(now, 20 * 24, 10 * 24, 3000), now);
        assert_eq!(late.amount, 0);
    }

    #[test]
    fn no_refund_threshold_wins_over_full() {
        let now = Utc::now();
        let policy = RefundPolicy {
            full_hours: 48,
            no_refund_hours: 24,
            prorate_days: 0,
            ..Default::default()
        };
        let q = quote_refund(&policy, &subject(now, 30, 100, 1000), now);
        assert_eq!(q.amount, 0);
    }

    #[test]
    fn hours_override_days() {
        let policy = RefundPolicy {
            full_hours: 2,
            full_days: 3,
            ..Default::default()
        };
        assert_eq!(policy.full_threshold_hours(), 2.0);
        assert_eq!(threshold_to_ratio(0, 1, 48.0), 0.5);
        assert_eq!(threshold_to_ratio(0, 0, 48.0), 0.0);
        assert_eq!(threshold_to_ratio(100, 0, 48.0), 1.0);
    }

    #[test]
    fn falls_back_to_age_and_order_amount() {
        let now = Utc::now();
        let policy = RefundPolicy {
            full_hours: 0,
            full_days: 0,
            prorate_hours: 10,
            ..Default::default()
        };
        let s = RefundSubject {
            created_at: Some(now - Duration::hours(4)),
            expire_at: None,
            monthly_price: 0,
            order_item_amount: 1000,
        };
        let q = quote_refund(&policy, &s, now);
        assert_eq!(q.rule, RefundRule::AgeFallback);
        assert_eq!(q.base_amount, 1000);
        assert_eq!(q.amount, 600);

        let unknown = RefundSubject {
            created_at: None,
            ..s
        };
        assert_eq!(quote_refund(&policy, &unknown, now).amount, 0);
    }

    #[test]
    fn policy_validation_rejects_bad_curve() {
        let mut policy = RefundPolicy {
            curve: vec![pt(10.0, 1.5)],
            ..Default::default()
        };
        assert!(policy.validate().is_err());
        policy.curve = vec![pt(10.0, 0.5)];
        assert!(policy.validate().is_ok());
        policy.full_days = -1;
        assert!(policy.validate().is_err());
    }
}
