use rustfst::prelude::*;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{DecodeError, Result};
use crate::lexicon::Lexicon;
use crate::model::{NGramModel, BOS, EOS, UNK};
use crate::vocab::Vocabulary;

/// Log probability charged for a unit the language model does not know
pub const OOV_SCORE: f64 = -1000.0;

/// Context of the language model after some emitted text
pub type LmState = StateId;

/// Decides which vocabulary symbols end a word.
pub trait BoundaryPolicy: Send + Sync {
    fn is_boundary(&self, symbol: &str) -> bool;
}

/// Symbols made only of whitespace end words.
#[derive(Debug, Default, Clone, Copy)]
pub struct Whitespace;

impl BoundaryPolicy for Whitespace {
    fn is_boundary(&self, symbol: &str) -> bool {
        !symbol.is_empty() && symbol.chars().all(char::is_whitespace)
    }
}

/// An explicit set of word-ending symbols, e.g. space plus punctuation.
#[derive(Debug, Default, Clone)]
pub struct Delimiters(pub Vec<String>);

impl BoundaryPolicy for Delimiters {
    fn is_boundary(&self, symbol: &str) -> bool {
        self.0.iter().any(|d| d == symbol)
    }
}

impl<F> BoundaryPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_boundary(&self, symbol: &str) -> bool {
        self(symbol)
    }
}

pub struct ScorerOptions {
    /// Word boundary detection for word-based models
    pub boundary: Box<dyn BoundaryPolicy>,
    /// Add `alpha * ln p(</s>)` to every final hypothesis
    pub score_end_of_sentence: bool,
}

impl Default for ScorerOptions {
    fn default() -> Self {
        Self {
            boundary: Box::new(Whitespace),
            score_end_of_sentence: false,
        }
    }
}

impl fmt::Debug for ScorerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScorerOptions")
            .field("score_end_of_sentence", &self.score_end_of_sentence)
            .finish_non_exhaustive()
    }
}

/// A snapshot of the blending weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    /// Language model weight
    pub alpha: f64,
    /// Bonus per scored word (or character)
    pub beta: f64,
}

impl Weights {
    /// Weighted contribution of one scored unit
    pub fn apply(&self, log_prob: f64) -> f64 {
        self.alpha * log_prob + self.beta
    }
}

/// Language model scorer shared by decoders.
///
/// The backing model is immutable. Alpha and beta can be changed at any
/// time, but a decode reads them once when it starts: callers must not
/// change them while a batch using this scorer is running, or items of that
/// batch may see different weights. Nothing detects or prevents this.
pub struct Scorer {
    alpha: AtomicU64,
    beta: AtomicU64,
    model: NGramModel,
    /// Spelling constraint for word-based models
    lexicon: Option<Lexicon>,
    vocabulary: Vocabulary,
    /// Word-ending flag of each class
    boundaries: Vec<bool>,
    is_character_based: bool,
    dict_size: usize,
    score_end_of_sentence: bool,
}

fn is_special(word: &str) -> bool {
    word == BOS || word == EOS || word == UNK
}

impl Scorer {
    pub fn new<P: AsRef<Path>>(
        alpha: f64,
        beta: f64,
        model_path: P,
        vocabulary: Vocabulary,
    ) -> Result<Self> {
        Self::with_options(alpha, beta, model_path, vocabulary, ScorerOptions::default())
    }

    pub fn with_options<P: AsRef<Path>>(
        alpha: f64,
        beta: f64,
        model_path: P,
        vocabulary: Vocabulary,
        options: ScorerOptions,
    ) -> Result<Self> {
        let path = model_path.as_ref();
        let model = NGramModel::read(path).map_err(|e| DecodeError::load(path, e))?;
        Self::from_model(alpha, beta, model, vocabulary, options)
            .map_err(|e| match e {
                DecodeError::Load { source, .. } => DecodeError::load(path, source),
                other => other,
            })
    }

    pub fn from_model(
        alpha: f64,
        beta: f64,
        model: NGramModel,
        vocabulary: Vocabulary,
        options: ScorerOptions,
    ) -> Result<Self> {
        let boundaries: Vec<bool> = vocabulary
            .symbols()
            .iter()
            .map(|s| options.boundary.is_boundary(s))
            .collect();
        let is_character_based = model
            .words()
            .filter(|w| !is_special(w))
            .all(|w| w.chars().count() == 1);

        let (lexicon, dict_size) = if is_character_based {
            let size = model.words().filter(|w| !is_special(w)).count();
            (None, size)
        } else {
            let lexicon = Lexicon::new(
                model.words().filter(|w| !is_special(w)),
                &vocabulary,
                |s| options.boundary.is_boundary(s),
            )
            .map_err(|e| DecodeError::load("<in-memory model>", e))?;
            let size = lexicon.len();
            (Some(lexicon), size)
        };

        log::info!(
            "Loaded {}-gram {} language model, dictionary size {}",
            model.order(),
            if is_character_based {
                "character"
            } else {
                "word"
            },
            dict_size
        );

        Ok(Self {
            alpha: AtomicU64::new(alpha.to_bits()),
            beta: AtomicU64::new(beta.to_bits()),
            model,
            lexicon,
            vocabulary,
            boundaries,
            is_character_based,
            dict_size,
            score_end_of_sentence: options.score_end_of_sentence,
        })
    }

    pub fn alpha(&self) -> f64 {
        f64::from_bits(self.alpha.load(Ordering::Relaxed))
    }

    pub fn beta(&self) -> f64 {
        f64::from_bits(self.beta.load(Ordering::Relaxed))
    }

    pub fn set_alpha(&self, alpha: f64) {
        self.alpha.store(alpha.to_bits(), Ordering::Relaxed);
    }

    pub fn set_beta(&self, beta: f64) {
        self.beta.store(beta.to_bits(), Ordering::Relaxed);
    }

    pub fn reset_params(&self, alpha: f64, beta: f64) {
        self.set_alpha(alpha);
        self.set_beta(beta);
    }

    pub fn weights(&self) -> Weights {
        Weights {
            alpha: self.alpha(),
            beta: self.beta(),
        }
    }

    pub fn is_character_based(&self) -> bool {
        self.is_character_based
    }

    pub fn max_order(&self) -> usize {
        self.model.order()
    }

    pub fn dict_size(&self) -> usize {
        self.dict_size
    }

    pub fn score_end_of_sentence(&self) -> bool {
        self.score_end_of_sentence
    }

    pub fn model(&self) -> &NGramModel {
        &self.model
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn lexicon(&self) -> Option<&Lexicon> {
        self.lexicon.as_ref()
    }

    /// Whether emitting `class` ends a word.
    pub fn is_boundary(&self, class: usize) -> bool {
        self.boundaries.get(class).copied().unwrap_or(false)
    }

    /// Context before any text has been emitted
    pub fn start_state(&self) -> LmState {
        self.model.start()
    }

    /// Raw natural-log probability of `unit` (a word, or a character for
    /// character-based models) in context `state`, and the next context.
    pub fn log_prob(&self, state: LmState, unit: &str) -> (f64, LmState) {
        self.model
            .label(unit)
            .and_then(|label| self.model.log_prob(state, label))
            .unwrap_or((OOV_SCORE, state))
    }

    /// Raw log probability of the word spelled by `classes`.
    pub fn log_prob_classes(&self, state: LmState, classes: &[usize]) -> (f64, LmState) {
        self.log_prob(state, &self.vocabulary.render(classes))
    }

    /// Incremental score of extending context `state` with `unit`, using the
    /// current weights.
    pub fn score(&self, state: LmState, unit: &str) -> (f64, LmState) {
        let (log_prob, next) = self.log_prob(state, unit);
        (self.weights().apply(log_prob), next)
    }

    /// Raw log probability of ending the utterance in context `state`.
    pub fn end_of_sentence(&self, state: LmState) -> f64 {
        self.model.final_log_prob(state).unwrap_or(OOV_SCORE)
    }

    /// Raw log probability of a sentence, `</s>` included.
    pub fn sentence_log_prob(&self, words: &[&str]) -> f64 {
        self.model.sentence_log_prob(words, OOV_SCORE)
    }
}

impl fmt::Debug for Scorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scorer")
            .field("weights", &self.weights())
            .field("max_order", &self.max_order())
            .field("dict_size", &self.dict_size)
            .field("is_character_based", &self.is_character_based)
            .finish_non_exhaustive()
    }
}
