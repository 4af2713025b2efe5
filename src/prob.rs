use ordered_float::OrderedFloat;
use std::cmp::Reverse;

/// Smallest positive value added before taking the log of a probability
const PROB_FLOOR: f64 = f32::MIN_POSITIVE as f64;

/// `ln(exp(a) + exp(b))` without overflow or underflow.
pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Convert one input value to natural log probability.
pub fn to_log_prob(value: f64, log_input: bool) -> f64 {
    if log_input {
        value
    } else {
        (value + PROB_FLOOR).ln()
    }
}

/// Classes worth expanding at one timestep, as `(class, ln p)`.
///
/// Classes are taken by decreasing probability until their cumulative mass
/// reaches `cutoff_prob`, and never more than `cutoff_top_n` of them. Without
/// pruning the classes come back in id order.
pub fn pruned_log_probs(
    row: &[f64],
    cutoff_prob: f64,
    cutoff_top_n: usize,
    log_input: bool,
) -> Vec<(usize, f64)> {
    let mut classes: Vec<(usize, f64)> = row.iter().copied().enumerate().collect();
    if cutoff_prob < 1.0 || cutoff_top_n < classes.len() {
        // stable, so equal probabilities keep id order
        classes.sort_by_key(|&(_, p)| Reverse(OrderedFloat(p)));
        let mut keep = cutoff_top_n.min(classes.len());
        if cutoff_prob < 1.0 {
            let mut mass = 0.0;
            keep = 0;
            for &(_, p) in &classes {
                mass += if log_input { p.exp() } else { p };
                keep += 1;
                if mass >= cutoff_prob || keep >= cutoff_top_n {
                    break;
                }
            }
        }
        classes.truncate(keep);
    }
    classes
        .into_iter()
        .map(|(c, p)| (c, to_log_prob(p, log_input)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_adds_in_log_space() {
        let lse = log_sum_exp(0.3f64.ln(), 0.5f64.ln());
        assert!((lse - 0.8f64.ln()).abs() < 1e-12);
        assert_eq!(log_sum_exp(f64::NEG_INFINITY, -2.0), -2.0);
        assert_eq!(
            log_sum_exp(f64::NEG_INFINITY, f64::NEG_INFINITY),
            f64::NEG_INFINITY
        );
        // no underflow far below f64::MIN_POSITIVE
        let tiny = log_sum_exp(-2000.0, -2000.0);
        assert!((tiny - (-2000.0 + 2f64.ln())).abs() < 1e-9);
    }

    #[test]
    fn it_keeps_everything_without_pruning() {
        let row = [0.2, 0.5, 0.3];
        let pruned = pruned_log_probs(&row, 1.0, 40, false);
        let classes: Vec<usize> = pruned.iter().map(|&(c, _)| c).collect();
        assert_eq!(classes, vec![0, 1, 2]);
        assert!((pruned[1].1 - 0.5f64.ln()).abs() < 1e-6);
    }

    #[test]
    fn it_prunes_to_top_n() {
        let row = [0.2, 0.5, 0.3];
        let pruned = pruned_log_probs(&row, 1.0, 2, false);
        let classes: Vec<usize> = pruned.iter().map(|&(c, _)| c).collect();
        assert_eq!(classes, vec![1, 2]);
    }

    #[test]
    fn it_prunes_by_cumulative_mass() {
        let row = [0.1, 0.6, 0.25, 0.05];
        let pruned = pruned_log_probs(&row, 0.8, 40, false);
        let classes: Vec<usize> = pruned.iter().map(|&(c, _)| c).collect();
        assert_eq!(classes, vec![1, 2]);
        let pruned = pruned_log_probs(&row, 0.5, 40, false);
        assert_eq!(pruned.len(), 1);
    }

    #[test]
    fn it_accepts_log_input() {
        let row: Vec<f64> = [0.1f64, 0.6, 0.25, 0.05].iter().map(|p| p.ln()).collect();
        let pruned = pruned_log_probs(&row, 0.8, 40, true);
        let classes: Vec<usize> = pruned.iter().map(|&(c, _)| c).collect();
        assert_eq!(classes, vec![1, 2]);
        assert!((pruned[0].1 - 0.6f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn it_breaks_ties_by_class_id() {
        let row = [0.25, 0.25, 0.25, 0.25];
        let pruned = pruned_log_probs(&row, 1.0, 2, false);
        let classes: Vec<usize> = pruned.iter().map(|&(c, _)| c).collect();
        assert_eq!(classes, vec![0, 1]);
    }
}
