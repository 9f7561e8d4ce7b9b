use crate::protocol::PredictionVector;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPrediction {
    pub digit: u8,
    /// Percentage with exactly two fraction digits, e.g. `"55.00"`.
    pub probability: String,
}

/// Orders digits by their displayed percentage, highest first.
///
/// Sorting happens on the rounded value so the order always agrees with what
/// is shown. Equal percentages keep ascending digit order.
pub fn rank(vector: &PredictionVector) -> Vec<RankedPrediction> {
    let mut ranked: Vec<(f64, RankedPrediction)> = vector
        .probabilities()
        .iter()
        .enumerate()
        .map(|(digit, probability)| {
            let probability = percent(*probability);
            let shown = probability.parse::<f64>().unwrap_or(0.0);
            (
                shown,
                RankedPrediction {
                    digit: digit as u8,
                    probability,
                },
            )
        })
        .collect();

    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    ranked.into_iter().map(|(_, prediction)| prediction).collect()
}

/// Formats `probability * 100` with two fraction digits, rounding exact
/// half-way values away from zero. `{:.2}` alone rounds those to even.
fn percent(probability: f64) -> String {
    let value = probability * 100.0;
    // a double sits exactly on a .xx5 boundary only when its fraction is an
    // odd multiple of 1/8, and scaling by 8 is exact
    let eighths = value * 8.0;
    let is_tie = eighths.fract() == 0.0 && eighths % 2.0 != 0.0;
    if is_tie {
        format!("{:.2}", value + value.signum() * 0.001)
    } else {
        format!("{:.2}", value)
    }
}

/// The uniform 10% distribution shown when nothing is drawn.
pub fn baseline() -> Vec<RankedPrediction> {
    rank(&PredictionVector::uniform())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(values: &[f64]) -> PredictionVector {
        PredictionVector::try_from(values.to_vec()).unwrap()
    }

    #[test]
    fn test_highest_probability_first() {
        let ranked = rank(&vector(&[
            0.01, 0.02, 0.03, 0.04, 0.05, 0.06, 0.07, 0.08, 0.09, 0.55,
        ]));

        assert_eq!(
            ranked[0],
            RankedPrediction {
                digit: 9,
                probability: "55.00".to_string(),
            }
        );
        let digits: Vec<u8> = ranked.iter().map(|p| p.digit).collect();
        assert_eq!(digits, vec![9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);
        assert_eq!(ranked[9].probability, "1.00");
    }

    #[test]
    fn test_uniform_keeps_digit_order() {
        let ranked = rank(&vector(&[0.1; 10]));

        for (index, prediction) in ranked.iter().enumerate() {
            assert_eq!(prediction.digit as usize, index);
            assert_eq!(prediction.probability, "10.00");
        }
        assert_eq!(ranked, baseline());
    }

    #[test]
    fn test_sorts_on_rounded_percentage() {
        // 0.300001 and 0.300004 both display as 30.00, so digit order decides
        let ranked = rank(&vector(&[
            0.0, 0.300001, 0.0, 0.300004, 0.0, 0.0, 0.0, 0.0, 0.0, 0.4,
        ]));

        let top: Vec<(u8, &str)> = ranked
            .iter()
            .take(3)
            .map(|p| (p.digit, p.probability.as_str()))
            .collect();
        assert_eq!(top, vec![(9, "40.00"), (1, "30.00"), (3, "30.00")]);
    }

    #[test]
    fn test_half_way_percentages_round_up() {
        assert_eq!(percent(0.28125), "28.13");
        assert_eq!(percent(0.71875), "71.88");
        assert_eq!(percent(0.55), "55.00");
        assert_eq!(percent(0.5), "50.00");
        assert_eq!(percent(0.0), "0.00");
    }

    #[test]
    fn test_half_way_tie_orders_by_digit() {
        // 28.125 shows as 28.13, the same as 28.13, so digit order decides
        let ranked = rank(&vector(&[
            0.28125, 0.2813, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ]));

        let top: Vec<(u8, &str)> = ranked
            .iter()
            .take(2)
            .map(|p| (p.digit, p.probability.as_str()))
            .collect();
        assert_eq!(top, vec![(0, "28.13"), (1, "28.13")]);
    }

    #[test]
    fn test_always_ten_entries() {
        let ranked = rank(&vector(&[0.0; 10]));
        assert_eq!(ranked.len(), 10);
        assert!(ranked.iter().all(|p| p.probability == "0.00"));
    }
}
