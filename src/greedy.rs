use ndarray::{ArrayView2, Axis};

use crate::beam::DecodeOutput;
use crate::prob::to_log_prob;

/// Best-path decoding: take the most likely class at every step, then drop
/// blanks and collapse repeats.
///
/// The score is the log probability of that single path, so it is a lower
/// bound on the score beam search gives the same text. Ties go to the lower
/// class id.
pub fn decode(probs: ArrayView2<f32>, blank_id: usize, log_input: bool) -> DecodeOutput {
    let mut score = 0.0;
    let mut tokens = Vec::new();
    let mut timesteps = Vec::new();
    let mut prev = None;
    for (t, row) in probs.axis_iter(Axis(0)).enumerate() {
        let mut best: Option<(usize, f32)> = None;
        for (c, &p) in row.iter().enumerate() {
            if best.map_or(true, |(_, b)| p > b) {
                best = Some((c, p));
            }
        }
        let Some((class, p)) = best else {
            continue;
        };
        score += to_log_prob(p as f64, log_input);
        if class != blank_id && prev != Some(class) {
            tokens.push(class);
            timesteps.push(t);
        }
        prev = Some(class);
    }
    DecodeOutput {
        score,
        am_score: score,
        lm_score: 0.0,
        tokens,
        timesteps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::BeamSearchDecoder;
    use crate::config::DecoderConfig;
    use ndarray::{arr2, Array2};

    #[test]
    fn it_collapses_the_best_path() {
        let probs = arr2(&[
            [0.1f32, 0.8, 0.1],
            [0.1, 0.7, 0.2],
            [0.6, 0.2, 0.2],
            [0.1, 0.8, 0.1],
            [0.2, 0.1, 0.7],
        ]);
        let output = decode(probs.view(), 0, false);
        assert_eq!(output.tokens, vec![1, 1, 2]);
        assert_eq!(output.timesteps, vec![0, 3, 4]);
        let expected: f64 = [0.8f64, 0.7, 0.6, 0.8, 0.7].iter().map(|p| p.ln()).sum();
        assert!((output.score - expected).abs() < 1e-5);
    }

    #[test]
    fn it_honours_the_blank_id() {
        let probs = arr2(&[[0.1f32, 0.8, 0.1], [0.1, 0.1, 0.8]]);
        let output = decode(probs.view(), 2, false);
        assert_eq!(output.tokens, vec![1]);
    }

    #[test]
    fn it_matches_a_single_beam_on_clean_input() {
        let classes = [0, 3, 3, 0, 1, 2, 2, 0, 0, 3];
        let probs = Array2::from_shape_fn((classes.len(), 4), |(t, c)| {
            if classes[t] == c {
                0.97f32
            } else {
                0.01
            }
        });
        let greedy = decode(probs.view(), 0, false);
        let config = DecoderConfig {
            beam_size: 1,
            ..Default::default()
        };
        let beam = BeamSearchDecoder::new(&config, None).decode(probs.view());
        assert_eq!(greedy.tokens, beam[0].tokens);
        assert_eq!(greedy.timesteps, beam[0].timesteps);
        assert!(greedy.score <= beam[0].score + 1e-9);
    }

    #[test]
    fn it_handles_empty_input() {
        let probs = Array2::<f32>::zeros((0, 5));
        let output = decode(probs.view(), 0, true);
        assert!(output.is_empty());
        assert_eq!(output.score, 0.0);
    }
}
