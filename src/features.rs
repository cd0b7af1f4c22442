use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::benford::benford_pvalue;
use crate::models::{AccountFeatures, ConsumptionRow};

/// Periods of history the dispersion window looks back over.
pub const WINDOW: usize = 12;

/// Periods the recent-average and digit-test sample covers.
pub const RECENT: usize = 6;

const EPSILON: f64 = 1e-6;

/// Computes one feature vector per account from its staged history.
///
/// Periods sort ascending per account and the window is the tail of
/// that order; months missing from the history shorten the window
/// rather than being backfilled.
pub fn compute_features(rows: &[ConsumptionRow]) -> Vec<AccountFeatures> {
    let mut by_account: BTreeMap<&str, Vec<(NaiveDate, f64)>> = BTreeMap::new();
    for row in rows {
        by_account
            .entry(row.cuenta.as_str())
            .or_default()
            .push((row.periodo, row.kwh));
    }

    let mut features = Vec::with_capacity(by_account.len());
    for (cuenta, mut series) in by_account {
        series.sort_by_key(|&(periodo, _)| periodo);
        let values: Vec<f64> = series.iter().map(|&(_, kwh)| kwh).collect();
        let window = tail(&values, WINDOW);
        let recent = tail(window, RECENT);

        let avg_recent = mean(recent);
        let std_window = population_std(window);
        features.push(AccountFeatures {
            cuenta: cuenta.to_string(),
            avg_recent,
            std_window,
            cv: std_window / (avg_recent + EPSILON),
            benford_pvalue: benford_pvalue(recent),
        });
    }
    features
}

fn tail(values: &[f64], len: usize) -> &[f64] {
    &values[values.len().saturating_sub(len)..]
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let avg = mean(values);
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}
