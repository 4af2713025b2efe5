use ndarray::{s, ArrayView3, Axis};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use crate::beam::{BeamSearchDecoder, DecodeOutput};
use crate::config::DecoderConfig;
use crate::error::{DecodeError, Result};
use crate::scorer::{Scorer, Weights};

/// Decode every sequence of a padded batch in parallel.
///
/// `probs` is laid out as [batch][time][class] and `lengths[i]` gives the
/// number of valid steps of item `i`; steps past it are ignored, and lengths
/// beyond the padded size are clamped to it. Results come back in input
/// order, each ranked best first. An item with no valid steps, or one whose
/// decoding panicked, yields no hypotheses.
///
/// The scorer weights are read once for the whole batch.
pub fn decode_batch(
    probs: ArrayView3<f32>,
    lengths: &[usize],
    config: &DecoderConfig,
    scorer: Option<&Scorer>,
) -> Result<Vec<Vec<DecodeOutput>>> {
    let (batch_size, max_time, num_classes) = probs.dim();
    if lengths.len() != batch_size {
        return Err(DecodeError::invalid_argument(format!(
            "got {} lengths for a batch of {}",
            lengths.len(),
            batch_size
        )));
    }
    config.validate(num_classes)?;
    if let Some(scorer) = scorer {
        if scorer.vocabulary().len() != num_classes {
            return Err(DecodeError::invalid_argument(format!(
                "scorer vocabulary has {} labels but the model emits {} classes",
                scorer.vocabulary().len(),
                num_classes
            )));
        }
    }
    if batch_size == 0 {
        return Ok(Vec::new());
    }

    let weights = scorer.map(Scorer::weights).unwrap_or(Weights {
        alpha: 0.0,
        beta: 0.0,
    });
    let num_workers = config.workers_for(batch_size);
    let deadline = config.timeout.map(|timeout| Instant::now() + timeout);
    log::debug!(
        "Decoding batch of {} with {} workers (beam {}, max length {})",
        batch_size,
        num_workers,
        config.beam_size,
        max_time
    );

    let decode_one = |i: usize| -> Vec<DecodeOutput> {
        let len = lengths[i].min(max_time);
        let item = probs.index_axis(Axis(0), i);
        let item = item.slice(s![..len, ..]);
        BeamSearchDecoder::with_weights(config, scorer, weights).decode(item)
    };

    let next = AtomicUsize::new(0);
    let mut results: Vec<Option<Vec<DecodeOutput>>> = vec![None; batch_size];
    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel();
        for worker in 0..num_workers {
            let tx = tx.clone();
            let next = &next;
            let decode_one = &decode_one;
            scope.spawn(move || loop {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= batch_size {
                    break;
                }
                let outputs = match panic::catch_unwind(AssertUnwindSafe(|| decode_one(i))) {
                    Ok(outputs) => outputs,
                    Err(_) => {
                        log::warn!("Worker {} panicked decoding item {}", worker, i);
                        Vec::new()
                    }
                };
                if tx.send((i, outputs)).is_err() {
                    break;
                }
            });
        }
        drop(tx);
        for (i, outputs) in rx {
            results[i] = Some(outputs);
        }
    });

    let completed = results.iter().filter(|r| r.is_some()).count();
    if completed < batch_size {
        log::warn!(
            "Batch timed out with {} of {} items decoded",
            completed,
            batch_size
        );
        return Err(DecodeError::Timeout {
            completed,
            total: batch_size,
        });
    }
    Ok(results.into_iter().flatten().collect())
}
