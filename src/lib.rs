use rustfst::fst_impls::VectorFst;
use rustfst::semirings::TropicalWeight;

/// rustfst does not define this but we will
pub type StdVectorFst = VectorFst<TropicalWeight>;

/// Error type shared by the whole crate
pub mod error;
/// Class id to symbol mapping
pub mod vocab;
/// ARPA reader producing backoff FSTs
pub mod arpa;
/// N-Gram language model over a backoff FST
pub mod model;
/// Spelling trie for word-based language models
pub mod lexicon;
/// Language model scoring for the decoder
pub mod scorer;
/// Log-space arithmetic and per-step class pruning
pub mod prob;
/// Prefix tree of beam search hypotheses
pub mod trie;
/// Decoder settings
pub mod config;
/// CTC prefix beam search
pub mod beam;
/// Best-path decoding
pub mod greedy;
/// Parallel decoding of padded batches
pub mod batch;
/// Tensor level entry points for host runtimes
pub mod api;

pub use api::{BatchTensors, CtcBeamDecoder};
pub use beam::{BeamSearchDecoder, DecodeOutput};
pub use config::DecoderConfig;
pub use error::{DecodeError, Result};
pub use model::NGramModel;
pub use scorer::{Scorer, ScorerOptions};
pub use vocab::Vocabulary;
