//! Boundary used by host runtimes: dense tensors in, dense tensors out.

use ndarray::{Array2, Array3, ArrayD, ArrayView1, ArrayView3, Ix1, Ix3};
use std::path::Path;
use std::sync::Arc;

use crate::batch;
use crate::config::DecoderConfig;
use crate::error::{DecodeError, Result};
use crate::scorer::Scorer;
use crate::vocab::Vocabulary;

/// Where a tensor's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

/// Tensor payload with its element type.
#[derive(Debug, Clone, PartialEq)]
pub enum HostArray {
    F32(ArrayD<f32>),
    I32(ArrayD<i32>),
}

impl HostArray {
    pub fn dtype(&self) -> &'static str {
        match self {
            HostArray::F32(_) => "float32",
            HostArray::I32(_) => "int32",
        }
    }

    pub fn ndim(&self) -> usize {
        match self {
            HostArray::F32(a) => a.ndim(),
            HostArray::I32(a) => a.ndim(),
        }
    }
}

/// A tensor handed over by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub data: HostArray,
    pub device: Device,
}

impl HostTensor {
    pub fn new(data: HostArray, device: Device) -> Self {
        Self { data, device }
    }

    fn check_cpu(&self, name: &str) -> Result<()> {
        if self.device != Device::Cpu {
            return Err(DecodeError::invalid_argument(format!(
                "{} must be on the CPU, found {:?}",
                name, self.device
            )));
        }
        Ok(())
    }

    fn wrong_type(&self, name: &str, expected: &str) -> DecodeError {
        DecodeError::invalid_argument(format!(
            "{} must be a {} tensor, got {} of rank {}",
            name,
            expected,
            self.data.dtype(),
            self.data.ndim()
        ))
    }

    fn as_f32_3d(&self, name: &str) -> Result<ArrayView3<'_, f32>> {
        self.check_cpu(name)?;
        match &self.data {
            HostArray::F32(a) => a
                .view()
                .into_dimensionality::<Ix3>()
                .map_err(|_| self.wrong_type(name, "rank 3 float32")),
            _ => Err(self.wrong_type(name, "rank 3 float32")),
        }
    }

    fn as_i32_1d(&self, name: &str) -> Result<ArrayView1<'_, i32>> {
        self.check_cpu(name)?;
        match &self.data {
            HostArray::I32(a) => a
                .view()
                .into_dimensionality::<Ix1>()
                .map_err(|_| self.wrong_type(name, "rank 1 int32")),
            _ => Err(self.wrong_type(name, "rank 1 int32")),
        }
    }
}

impl From<Array3<f32>> for HostTensor {
    fn from(array: Array3<f32>) -> Self {
        Self::new(HostArray::F32(array.into_dyn()), Device::Cpu)
    }
}

impl From<ndarray::Array1<i32>> for HostTensor {
    fn from(array: ndarray::Array1<i32>) -> Self {
        Self::new(HostArray::I32(array.into_dyn()), Device::Cpu)
    }
}

/// Decoded batch, zero filled past what was produced.
///
/// `lengths[[i, k]]` is the number of valid entries of `tokens[[i, k, ..]]`
/// and `timesteps[[i, k, ..]]`; hypotheses that were not produced have
/// length 0.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTensors {
    /// [batch][beam][time]
    pub tokens: Array3<i32>,
    /// [batch][beam]
    pub scores: Array2<f32>,
    /// [batch][beam][time]
    pub timesteps: Array3<i32>,
    /// [batch][beam]
    pub lengths: Array2<i32>,
}

/// Load a language model for the vocabulary described by `label_spec`.
pub fn build_scorer<P: AsRef<Path>>(
    alpha: f64,
    beta: f64,
    model_path: P,
    label_spec: &[u8],
) -> Result<Arc<Scorer>> {
    let vocabulary = Vocabulary::from_label_spec(label_spec)?;
    Ok(Arc::new(Scorer::new(alpha, beta, model_path, vocabulary)?))
}

pub fn scorer_is_character_based(scorer: &Scorer) -> bool {
    scorer.is_character_based()
}

pub fn scorer_max_order(scorer: &Scorer) -> usize {
    scorer.max_order()
}

pub fn scorer_dict_size(scorer: &Scorer) -> usize {
    scorer.dict_size()
}

/// Must not be called while a batch using `scorer` is running.
pub fn scorer_set_weights(scorer: &Scorer, alpha: f64, beta: f64) {
    scorer.reset_params(alpha, beta);
}

pub fn scorer_get_weights(scorer: &Scorer) -> (f64, f64) {
    (scorer.alpha(), scorer.beta())
}

/// Decode a padded batch given as host tensors.
///
/// `probabilities` is float32 [batch][time][class] on the CPU and
/// `valid_lengths` int32 [batch]. Settings not passed here (the timeout) come
/// from the `CTC_*` environment.
#[allow(clippy::too_many_arguments)]
pub fn decode_batch(
    probabilities: &HostTensor,
    valid_lengths: &HostTensor,
    label_spec: &[u8],
    beam_size: usize,
    worker_count: usize,
    cutoff_prob: f64,
    cutoff_top_n: usize,
    blank_id: usize,
    log_input: bool,
    scorer: Option<&Arc<Scorer>>,
) -> Result<BatchTensors> {
    let probs = probabilities.as_f32_3d("probabilities")?;
    let lengths = valid_lengths.as_i32_1d("valid_lengths")?;
    let vocabulary = Vocabulary::from_label_spec(label_spec)?;
    let (_, _, num_classes) = probs.dim();
    if vocabulary.len() != num_classes {
        return Err(DecodeError::invalid_argument(format!(
            "label spec has {} labels but probabilities have {} classes",
            vocabulary.len(),
            num_classes
        )));
    }
    let lengths = lengths
        .iter()
        .map(|&len| {
            usize::try_from(len).map_err(|_| {
                DecodeError::invalid_argument(format!("negative sequence length {}", len))
            })
        })
        .collect::<Result<Vec<usize>>>()?;
    let config = DecoderConfig {
        beam_size,
        cutoff_prob,
        cutoff_top_n,
        blank_id,
        log_input,
        num_workers: worker_count,
        ..DecoderConfig::from_env()
    };
    run(probs, &lengths, &config, scorer.map(Arc::as_ref))
}

fn run(
    probs: ArrayView3<f32>,
    lengths: &[usize],
    config: &DecoderConfig,
    scorer: Option<&Scorer>,
) -> Result<BatchTensors> {
    let (batch_size, max_time, _) = probs.dim();
    let results = batch::decode_batch(probs, lengths, config, scorer)?;

    let beam = config.beam_size;
    let mut out = BatchTensors {
        tokens: Array3::zeros((batch_size, beam, max_time)),
        scores: Array2::zeros((batch_size, beam)),
        timesteps: Array3::zeros((batch_size, beam, max_time)),
        lengths: Array2::zeros((batch_size, beam)),
    };
    for (i, outputs) in results.iter().enumerate() {
        for (k, output) in outputs.iter().enumerate().take(beam) {
            out.scores[[i, k]] = output.score as f32;
            out.lengths[[i, k]] = output.len() as i32;
            for (t, (&token, &step)) in output.tokens.iter().zip(&output.timesteps).enumerate() {
                out.tokens[[i, k, t]] = token as i32;
                out.timesteps[[i, k, t]] = step as i32;
            }
        }
    }
    Ok(out)
}

/// Beam search decoder holding its labels, settings and optional scorer.
#[derive(Debug)]
pub struct CtcBeamDecoder {
    vocabulary: Vocabulary,
    config: DecoderConfig,
    scorer: Option<Arc<Scorer>>,
}

impl CtcBeamDecoder {
    /// `labels` lists the symbol of every class, the blank included. With a
    /// `model_path` the decoder rescores with that language model, weighted
    /// by `alpha` and `beta`.
    pub fn new<I, S>(
        labels: I,
        model_path: Option<&Path>,
        alpha: f64,
        beta: f64,
        config: DecoderConfig,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let vocabulary = Vocabulary::from_labels(labels);
        config.validate(vocabulary.len())?;
        let scorer = match model_path {
            Some(path) => Some(Arc::new(Scorer::new(
                alpha,
                beta,
                path,
                vocabulary.clone(),
            )?)),
            None => None,
        };
        Ok(Self {
            vocabulary,
            config,
            scorer,
        })
    }

    /// Decode [batch][time][class] probabilities. Without `seq_lens` every
    /// item uses the full time dimension.
    pub fn decode(&self, probs: ArrayView3<f32>, seq_lens: Option<&[usize]>) -> Result<BatchTensors> {
        let (batch_size, max_time, _) = probs.dim();
        let full;
        let lengths = match seq_lens {
            Some(lengths) => lengths,
            None => {
                full = vec![max_time; batch_size];
                &full
            }
        };
        run(probs, lengths, &self.config, self.scorer.as_deref())
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn scorer(&self) -> Option<&Arc<Scorer>> {
        self.scorer.as_ref()
    }

    pub fn character_based(&self) -> Option<bool> {
        self.scorer.as_deref().map(scorer_is_character_based)
    }

    pub fn max_order(&self) -> Option<usize> {
        self.scorer.as_deref().map(scorer_max_order)
    }

    pub fn dict_size(&self) -> Option<usize> {
        self.scorer.as_deref().map(scorer_dict_size)
    }

    /// No effect without a scorer.
    pub fn reset_params(&self, alpha: f64, beta: f64) {
        if let Some(scorer) = &self.scorer {
            scorer_set_weights(scorer, alpha, beta);
        }
    }
}
