use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Minimum sample size before the digit test says anything at all.
const MIN_SAMPLE: usize = 20;

/// Chi-square degrees of freedom for nine leading-digit buckets.
const DEGREES_OF_FREEDOM: f64 = 8.0;

/// Leading digit of a reading's truncated integer part, if it has one.
/// Sub-unit readings like 0.7 truncate to zero and carry no digit.
pub fn leading_digit(value: f64) -> Option<u32> {
    if !value.is_finite() {
        return None;
    }
    let rendered = format!("{:.0}", value.abs().trunc());
    match rendered.bytes().next() {
        Some(b @ b'1'..=b'9') => Some(u32::from(b - b'0')),
        _ => None,
    }
}

/// P-value of a chi-square test of the leading-digit distribution
/// against Benford's law.
///
/// Only finite, strictly positive readings form the sample; fewer than
/// `MIN_SAMPLE` of those gives a neutral 0.5, never a verdict. Sub-unit
/// readings stay in the sample but contribute no digit.
pub fn benford_pvalue(values: &[f64]) -> f64 {
    let sample: Vec<f64> = values
        .iter()
        .copied()
        .filter(|v| v.is_finite() && *v > 0.0)
        .collect();
    if sample.len() < MIN_SAMPLE {
        return 0.5;
    }

    let mut counts = [0u32; 9];
    for &value in &sample {
        if let Some(digit) = leading_digit(value) {
            counts[(digit - 1) as usize] += 1;
        }
    }

    let total: u32 = counts.iter().sum();
    if total == 0 {
        return 0.5;
    }

    let total = f64::from(total);
    let mut stat = 0.0;
    for (index, &observed) in counts.iter().enumerate() {
        let digit = (index + 1) as f64;
        let expected = total * (1.0 + 1.0 / digit).log10();
        let diff = f64::from(observed) - expected;
        stat += diff * diff / expected;
    }

    match ChiSquared::new(DEGREES_OF_FREEDOM) {
        Ok(dist) => 1.0 - dist.cdf(stat),
        Err(_) => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_digit_of_plain_values() {
        assert_eq!(leading_digit(123.4), Some(1));
        assert_eq!(leading_digit(9.99), Some(9));
        assert_eq!(leading_digit(-845.0), Some(8));
        assert_eq!(leading_digit(0.0), None);
        assert_eq!(leading_digit(0.7), None);
        assert_eq!(leading_digit(f64::NAN), None);
    }

    #[test]
    fn small_samples_are_neutral() {
        let values: Vec<f64> = (1..=19).map(|n| n as f64 * 7.0).collect();
        assert_eq!(benford_pvalue(&values), 0.5);
        assert_eq!(benford_pvalue(&[]), 0.5);
    }

    #[test]
    fn zeros_and_negatives_do_not_count_toward_the_sample() {
        // 19 usable values padded with readings the filter drops.
        let mut values: Vec<f64> = (1..=19).map(|n| n as f64 * 7.0).collect();
        values.extend([0.0, -120.0, f64::NAN, -3.5, 0.0]);
        assert_eq!(benford_pvalue(&values), 0.5);
    }

    #[test]
    fn all_sub_unit_sample_is_neutral() {
        // Positive and plentiful, but no value carries a leading digit.
        let values = vec![0.25; 25];
        assert_eq!(benford_pvalue(&values), 0.5);
    }

    #[test]
    fn benford_distributed_sample_scores_near_one() {
        // Leading-digit counts proportional to log10(1 + 1/d) over a
        // sample of 1000; the chi-square statistic is almost zero.
        let counts = [301usize, 176, 125, 97, 79, 67, 58, 51, 46];
        let mut values = Vec::new();
        for (index, &count) in counts.iter().enumerate() {
            let digit = (index + 1) as f64;
            values.extend(std::iter::repeat(digit * 100.0).take(count));
        }
        assert_eq!(values.len(), 1000);
        assert!(benford_pvalue(&values) > 0.999);
    }

    #[test]
    fn uniform_digits_score_near_zero() {
        // Fabricated readings with uniform leading digits diverge
        // sharply from Benford on a big sample.
        let mut values = Vec::new();
        for digit in 1..=9u32 {
            values.extend(std::iter::repeat(f64::from(digit) * 1000.0).take(100));
        }
        assert!(benford_pvalue(&values) < 0.01);
    }
}
