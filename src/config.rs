use std::time::Duration;

use crate::error::{DecodeError, Result};

/// Beam search and batching parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    /// Hypotheses kept after each step
    pub beam_size: usize,
    /// Cumulative probability mass of classes expanded per step, in (0, 1]
    pub cutoff_prob: f64,
    /// Most classes expanded per step
    pub cutoff_top_n: usize,
    /// Class id of the CTC blank
    pub blank_id: usize,
    /// Inputs are natural log probabilities rather than probabilities
    pub log_input: bool,
    /// Worker threads for batches; 0 means one per physical core
    pub num_workers: usize,
    /// Stop starting new batch items after this long
    pub timeout: Option<Duration>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            beam_size: 100,
            cutoff_prob: 1.0,
            cutoff_top_n: 40,
            blank_id: 0,
            log_input: false,
            num_workers: 4,
            timeout: None,
        }
    }
}

impl DecoderConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides("CTC_");
        config
    }

    fn apply_env_overrides(&mut self, prefix: &str) {
        let parse_env = |suffix: &str| std::env::var(format!("{prefix}{suffix}")).ok();

        if let Some(v) = parse_env("BEAM_SIZE").and_then(|s| s.parse::<usize>().ok()) {
            self.beam_size = v.max(1);
        }
        if let Some(v) = parse_env("CUTOFF_PROB").and_then(|s| s.parse().ok()) {
            self.cutoff_prob = v;
        }
        if let Some(v) = parse_env("CUTOFF_TOP_N").and_then(|s| s.parse::<usize>().ok()) {
            self.cutoff_top_n = v.max(1);
        }
        if let Some(v) = parse_env("BLANK_ID").and_then(|s| s.parse().ok()) {
            self.blank_id = v;
        }
        if let Some(v) = parse_env("LOG_INPUT") {
            self.log_input = matches!(v.trim(), "1" | "true" | "yes");
        }
        if let Some(v) = parse_env("NUM_WORKERS").and_then(|s| s.parse().ok()) {
            self.num_workers = v;
        }
        if let Some(v) = parse_env("TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.timeout = Some(Duration::from_millis(v));
        }
    }

    /// Check the parameters against a model emitting `num_classes` classes.
    pub fn validate(&self, num_classes: usize) -> Result<()> {
        if self.beam_size == 0 {
            return Err(DecodeError::invalid_argument("beam_size must be at least 1"));
        }
        if self.cutoff_top_n == 0 {
            return Err(DecodeError::invalid_argument(
                "cutoff_top_n must be at least 1",
            ));
        }
        if !(self.cutoff_prob > 0.0 && self.cutoff_prob <= 1.0) {
            return Err(DecodeError::invalid_argument(format!(
                "cutoff_prob must be in (0, 1], got {}",
                self.cutoff_prob
            )));
        }
        if self.blank_id >= num_classes {
            return Err(DecodeError::invalid_argument(format!(
                "blank_id {} out of range for {} classes",
                self.blank_id, num_classes
            )));
        }
        Ok(())
    }

    /// Workers to use for a batch of `batch_size` items.
    pub fn workers_for(&self, batch_size: usize) -> usize {
        let requested = if self.num_workers == 0 {
            num_cpus::get_physical()
        } else {
            self.num_workers
        };
        requested.min(batch_size).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_accepts_defaults() {
        let config = DecoderConfig::default();
        assert!(config.validate(29).is_ok());
        assert_eq!(config.beam_size, 100);
        assert_eq!(config.cutoff_top_n, 40);
    }

    #[test]
    fn it_rejects_bad_parameters() {
        let bad = [
            DecoderConfig {
                beam_size: 0,
                ..Default::default()
            },
            DecoderConfig {
                cutoff_top_n: 0,
                ..Default::default()
            },
            DecoderConfig {
                cutoff_prob: 0.0,
                ..Default::default()
            },
            DecoderConfig {
                cutoff_prob: 1.5,
                ..Default::default()
            },
            DecoderConfig {
                cutoff_prob: f64::NAN,
                ..Default::default()
            },
            DecoderConfig {
                blank_id: 5,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                config.validate(5),
                Err(DecodeError::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn it_clamps_workers_to_batch() {
        let config = DecoderConfig {
            num_workers: 8,
            ..Default::default()
        };
        assert_eq!(config.workers_for(3), 3);
        assert_eq!(config.workers_for(20), 8);
        assert_eq!(config.workers_for(0), 1);
        let auto = DecoderConfig {
            num_workers: 0,
            ..Default::default()
        };
        assert!(auto.workers_for(1000) >= 1);
        assert_eq!(auto.workers_for(1), 1);
    }

    #[test]
    fn it_reads_env_overrides() {
        std::env::set_var("CTCTEST_BEAM_SIZE", "7");
        std::env::set_var("CTCTEST_LOG_INPUT", "true");
        std::env::set_var("CTCTEST_CUTOFF_TOP_N", "0");
        let mut config = DecoderConfig::default();
        config.apply_env_overrides("CTCTEST_");
        assert_eq!(config.beam_size, 7);
        assert!(config.log_input);
        assert_eq!(config.cutoff_top_n, 1);
        assert_eq!(config.cutoff_prob, 1.0);
    }
}
