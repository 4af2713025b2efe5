use ndarray::{ArrayView1, ArrayView2, Axis};
use ordered_float::OrderedFloat;
use std::cmp::Reverse;

use crate::config::DecoderConfig;
use crate::prob::{log_sum_exp, pruned_log_probs, to_log_prob};
use crate::scorer::{Scorer, Weights};
use crate::trie::{NodeId, PrefixArena, ROOT};

/// One ranked hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOutput {
    /// Combined log score, `am_score + lm_score`
    pub score: f64,
    /// Acoustic log probability of the prefix
    pub am_score: f64,
    /// Weighted language model contribution, bonuses included
    pub lm_score: f64,
    /// Emitted class ids, blanks and repeats collapsed
    pub tokens: Vec<usize>,
    /// Step at which each token was emitted
    pub timesteps: Vec<usize>,
}

impl DecodeOutput {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// CTC prefix beam search over one sequence.
///
/// Feed rows with [`advance`](Self::advance) and collect the ranked
/// hypotheses with [`finish`](Self::finish), or run a whole matrix with
/// [`decode`](Self::decode).
pub struct BeamSearchDecoder<'s> {
    beam_size: usize,
    cutoff_prob: f64,
    cutoff_top_n: usize,
    blank_id: usize,
    log_input: bool,
    scorer: Option<&'s Scorer>,
    /// Weights read once from the scorer
    weights: Weights,
    arena: PrefixArena,
    /// Current beam, best first
    prefixes: Vec<NodeId>,
    /// Steps consumed so far
    time: usize,
}

impl<'s> BeamSearchDecoder<'s> {
    pub fn new(config: &DecoderConfig, scorer: Option<&'s Scorer>) -> Self {
        let weights = scorer.map(Scorer::weights).unwrap_or(Weights {
            alpha: 0.0,
            beta: 0.0,
        });
        Self::with_weights(config, scorer, weights)
    }

    /// Use `weights` instead of the scorer's current ones.
    pub fn with_weights(config: &DecoderConfig, scorer: Option<&'s Scorer>, weights: Weights) -> Self {
        let lm_state = scorer.map(Scorer::start_state);
        let dict_state = scorer.and_then(Scorer::lexicon).map(|lex| lex.start());
        Self {
            beam_size: config.beam_size.max(1),
            cutoff_prob: config.cutoff_prob,
            cutoff_top_n: config.cutoff_top_n.max(1),
            blank_id: config.blank_id,
            log_input: config.log_input,
            scorer,
            weights,
            arena: PrefixArena::new(lm_state, dict_state),
            prefixes: vec![ROOT],
            time: 0,
        }
    }

    /// Steps consumed so far
    pub fn time(&self) -> usize {
        self.time
    }

    /// Size of the current beam
    pub fn num_prefixes(&self) -> usize {
        self.prefixes.len()
    }

    /// Decode every row of `probs` ([time][class]).
    pub fn decode(mut self, probs: ArrayView2<f32>) -> Vec<DecodeOutput> {
        for row in probs.axis_iter(Axis(0)) {
            self.advance(row);
        }
        self.finish()
    }

    /// Find or create the child of `parent` emitting `class`.
    ///
    /// Returns `None` when the lexicon forbids the extension. Newly created
    /// or revived nodes are appended to `joined`.
    fn extend(&mut self, parent: NodeId, class: usize, joined: &mut Vec<NodeId>) -> Option<NodeId> {
        if let Some(child) = self.arena.child(parent, class) {
            if !self.arena.node(child).exists {
                self.arena.revive(child, self.time);
                joined.push(child);
            }
            return Some(child);
        }

        let node = self.arena.node(parent);
        let (lm_state, dict_state) = (node.lm_state, node.dict_state);
        let (lm_delta, lm_state, dict_state) = match self.scorer {
            None => (0.0, None, None),
            Some(scorer) => {
                let boundary = scorer.is_boundary(class);
                let dict_state = match (scorer.lexicon(), dict_state) {
                    (Some(lexicon), Some(state)) if boundary => {
                        if !lexicon.is_word_end(state) {
                            return None;
                        }
                        Some(lexicon.start())
                    }
                    (Some(lexicon), Some(state)) => Some(lexicon.step(state, class)?),
                    _ => None,
                };
                let context = lm_state.unwrap_or_else(|| scorer.start_state());
                if scorer.is_character_based() {
                    let (log_prob, next) = scorer.log_prob_classes(context, &[class]);
                    (self.weights.apply(log_prob), Some(next), dict_state)
                } else if boundary {
                    let word = self.arena.trailing_word(parent, |c| scorer.is_boundary(c));
                    if word.is_empty() {
                        (0.0, Some(context), dict_state)
                    } else {
                        let (log_prob, next) = scorer.log_prob_classes(context, &word);
                        (self.weights.apply(log_prob), Some(next), dict_state)
                    }
                } else {
                    (0.0, Some(context), dict_state)
                }
            }
        };

        let child = self
            .arena
            .add_child(parent, class, self.time, lm_delta, lm_state, dict_state);
        joined.push(child);
        Some(child)
    }

    /// Consume one row of class probabilities (or log probabilities).
    pub fn advance(&mut self, row: ArrayView1<f32>) {
        let row: Vec<f64> = row.iter().map(|&p| p as f64).collect();
        let log_probs = pruned_log_probs(&row, self.cutoff_prob, self.cutoff_top_n, self.log_input);

        // With a language model, skip extensions that cannot beat the worst
        // hypothesis of a full beam followed by a blank.
        let num_prefixes = self.prefixes.len().min(self.beam_size);
        let mut min_cutoff = f64::NEG_INFINITY;
        let mut full_beam = false;
        if self.scorer.is_some() && num_prefixes > 0 {
            let blank = row
                .get(self.blank_id)
                .map(|&p| to_log_prob(p, self.log_input))
                .unwrap_or(f64::NEG_INFINITY);
            let worst = self.arena.node(self.prefixes[num_prefixes - 1]).score;
            min_cutoff = worst + blank - self.weights.beta.max(0.0);
            full_beam = num_prefixes == self.beam_size;
        }

        let mut joined = Vec::new();
        for &(class, log_prob) in &log_probs {
            for i in 0..num_prefixes {
                let id = self.prefixes[i];
                let node = self.arena.node(id);
                let (score, last, b_prev, nb_prev) = (
                    node.score,
                    node.class,
                    node.log_prob_b_prev,
                    node.log_prob_nb_prev,
                );
                if full_beam && log_prob + score < min_cutoff {
                    break;
                }
                if class == self.blank_id {
                    let node = self.arena.node_mut(id);
                    node.log_prob_b_cur = log_sum_exp(node.log_prob_b_cur, log_prob + score);
                    continue;
                }
                let repeat = last == Some(class);
                if repeat {
                    let node = self.arena.node_mut(id);
                    node.log_prob_nb_cur = log_sum_exp(node.log_prob_nb_cur, log_prob + nb_prev);
                    if b_prev == f64::NEG_INFINITY {
                        continue;
                    }
                }
                let Some(child) = self.extend(id, class, &mut joined) else {
                    continue;
                };
                // a repeat only starts a new emission after a blank
                let log_p = if repeat {
                    log_prob + b_prev
                } else {
                    log_prob + score
                };
                let child = self.arena.node_mut(child);
                child.log_prob_nb_cur = log_sum_exp(child.log_prob_nb_cur, log_p + child.lm_delta);
            }
        }

        let mut candidates = std::mem::take(&mut self.prefixes);
        candidates.extend(joined);
        for &id in &candidates {
            self.arena.commit(id);
        }
        candidates.retain(|&id| {
            let keep = self.arena.node(id).score > f64::NEG_INFINITY;
            if !keep {
                self.arena.remove(id);
            }
            keep
        });
        candidates.sort_by_key(|&id| Reverse(OrderedFloat(self.arena.node(id).score)));
        for &id in candidates.iter().skip(self.beam_size) {
            self.arena.remove(id);
        }
        candidates.truncate(self.beam_size);
        self.prefixes = candidates;
        self.time += 1;
    }

    /// Close out language model scoring and rank the beam.
    ///
    /// Returns nothing if no step was consumed.
    pub fn finish(mut self) -> Vec<DecodeOutput> {
        if self.time == 0 {
            return Vec::new();
        }
        if let Some(scorer) = self.scorer {
            for &id in &self.prefixes {
                let node = self.arena.node(id);
                let mut state = node.lm_state.unwrap_or_else(|| scorer.start_state());
                let mut bonus = 0.0;
                let pending = match node.class {
                    Some(class) => !scorer.is_character_based() && !scorer.is_boundary(class),
                    None => false,
                };
                if pending {
                    let word = self.arena.trailing_word(id, |c| scorer.is_boundary(c));
                    if !word.is_empty() {
                        let (log_prob, next) = scorer.log_prob_classes(state, &word);
                        bonus += self.weights.apply(log_prob);
                        state = next;
                    }
                }
                if scorer.score_end_of_sentence() {
                    bonus += self.weights.alpha * scorer.end_of_sentence(state);
                }
                let node = self.arena.node_mut(id);
                node.score += bonus;
                node.lm_score += bonus;
            }
            self.prefixes
                .sort_by_key(|&id| Reverse(OrderedFloat(self.arena.node(id).score)));
        }

        log::trace!(
            "beam search finished after {} steps with {} hypotheses ({} prefixes held)",
            self.time,
            self.prefixes.len(),
            self.arena.len()
        );

        self.prefixes
            .iter()
            .map(|&id| {
                let node = self.arena.node(id);
                let (tokens, timesteps) = self.arena.path(id);
                DecodeOutput {
                    score: node.score,
                    am_score: node.score - node.lm_score,
                    lm_score: node.lm_score,
                    tokens,
                    timesteps,
                }
            })
            .collect()
    }
}
