use anyhow::{anyhow, Context, Result};
use rustfst::prelude::*;
use rustfst::semirings::Semiring;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use crate::arpa::read_arpa;
use crate::StdVectorFst;

/// Sentence start symbol
pub const BOS: &str = "<s>";
/// Sentence end symbol
pub const EOS: &str = "</s>";
/// Unknown word symbol
pub const UNK: &str = "<unk>";

/// Backoff N-Gram model stored as an FST.
///
/// Each state is an n-gram context. Outgoing arcs carry `-ln p(word |
/// context)`, the single epsilon arc (if any) carries the backoff cost, and
/// final weights carry the cost of `</s>`.
#[derive(Debug)]
pub struct NGramModel {
    /// Underlying FST, arcs sorted by input label
    fst: StdVectorFst,
    /// Word symbols
    syms: Arc<SymbolTable>,
    /// Highest order in the model
    hi_order: u8,
    /// Order of each state (of its outgoing arcs)
    state_orders: Vec<u8>,
    /// Backoff destination and cost of each state
    backoffs: Vec<Option<(StateId, f32)>>,
    /// ID of the unigram state
    unigram: StateId,
}

impl NGramModel {
    pub fn new(mut fst: StdVectorFst) -> Result<Self> {
        let syms = fst
            .input_symbols()
            .cloned()
            .ok_or_else(|| anyhow!("N-Gram FST has no input symbol table"))?;
        if fst.start().is_none() {
            return Err(anyhow!("N-Gram FST has no start state"));
        }
        tr_sort(&mut fst, ILabelCompare {});

        let num_states = fst.num_states();
        let mut backoffs = Vec::with_capacity(num_states);
        for s in 0..num_states {
            let trs = fst.get_trs(s as StateId)?;
            let mut eps = trs.trs().iter().filter(|tr| tr.ilabel == EPS_LABEL);
            let backoff = eps.next().map(|tr| (tr.nextstate, *tr.weight.value()));
            if eps.next().is_some() {
                return Err(anyhow!("state {} has more than one backoff arc", s));
            }
            backoffs.push(backoff);
        }
        let unigrams: Vec<StateId> = (0..num_states as StateId)
            .filter(|&s| backoffs[s as usize].is_none())
            .collect();
        let unigram = match unigrams[..] {
            [unigram] => unigram,
            _ => {
                return Err(anyhow!(
                    "expected one state without backoff, found {}",
                    unigrams.len()
                ))
            }
        };

        let state_orders = Self::state_orders(&backoffs)?;
        let hi_order = state_orders.iter().copied().max().unwrap_or(1);
        Ok(Self {
            fst,
            syms,
            hi_order,
            state_orders,
            backoffs,
            unigram,
        })
    }

    /// Orders follow from the backoff chains: one more than the backoff state.
    fn state_orders(backoffs: &[Option<(StateId, f32)>]) -> Result<Vec<u8>> {
        let mut orders = vec![0u8; backoffs.len()];
        for s in 0..backoffs.len() {
            let mut chain = Vec::new();
            let mut cur = s;
            while orders[cur] == 0 {
                chain.push(cur);
                if chain.len() > backoffs.len() {
                    return Err(anyhow!("backoff cycle through state {}", s));
                }
                match backoffs[cur] {
                    Some((next, _)) => cur = next as usize,
                    None => break,
                }
            }
            let mut order = orders[cur];
            for &state in chain.iter().rev() {
                order += 1;
                orders[state] = order;
            }
        }
        Ok(orders)
    }

    /// Load from an ARPA file or a binary FST with symbol tables.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut fh = BufReader::new(
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        );
        let mut head = [0u8; 64];
        let n = fh.read(&mut head)?;
        let is_arpa = String::from_utf8_lossy(&head[..n])
            .trim_start()
            .starts_with("\\data\\");
        let fst = if is_arpa {
            let fh = BufReader::new(File::open(path)?);
            read_arpa(fh).with_context(|| format!("malformed ARPA file {}", path.display()))?
        } else {
            StdVectorFst::read(path)
                .with_context(|| format!("malformed FST file {}", path.display()))?
        };
        Self::new(fst)
    }

    pub fn fst(&self) -> &StdVectorFst {
        &self.fst
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.syms
    }

    /// Highest n-gram order
    pub fn order(&self) -> usize {
        self.hi_order as usize
    }

    pub fn state_order(&self, state: StateId) -> usize {
        self.state_orders.get(state as usize).copied().unwrap_or(0) as usize
    }

    /// Context at the start of a sentence
    pub fn start(&self) -> StateId {
        // checked in new()
        self.fst.start().unwrap_or(self.unigram)
    }

    pub fn unigram_state(&self) -> StateId {
        self.unigram
    }

    /// Label of a word, `None` if the model does not know it.
    pub fn label(&self, word: &str) -> Option<Label> {
        self.syms.get_label(word).filter(|&l| l != EPS_LABEL)
    }

    /// Words of the model, excluding epsilon
    pub fn words(&self) -> impl Iterator<Item = &str> + '_ {
        (1..self.syms.len() as Label).filter_map(move |l| self.syms.get_symbol(l))
    }

    fn find_tr(&self, state: StateId, label: Label) -> Option<Tr<TropicalWeight>> {
        let trs = self.fst.get_trs(state).ok()?;
        let trs = trs.trs();
        trs.binary_search_by_key(&label, |tr| tr.ilabel)
            .ok()
            .map(|idx| trs[idx].clone())
    }

    /// Natural log probability of `label` after context `state`, following
    /// backoff arcs, and the context reached. `None` if the label is not
    /// even a unigram.
    pub fn log_prob(&self, mut state: StateId, label: Label) -> Option<(f64, StateId)> {
        let mut cost = 0.0f64;
        loop {
            if let Some(tr) = self.find_tr(state, label) {
                return Some((-(cost + *tr.weight.value() as f64), tr.nextstate));
            }
            let (next, backoff) = (*self.backoffs.get(state as usize)?)?;
            cost += backoff as f64;
            state = next;
        }
    }

    /// Natural log probability of ending the sentence after context `state`.
    pub fn final_log_prob(&self, mut state: StateId) -> Option<f64> {
        let mut cost = 0.0f64;
        loop {
            if let Ok(Some(weight)) = self.fst.final_weight(state) {
                return Some(-(cost + *weight.value() as f64));
            }
            let (next, backoff) = (*self.backoffs.get(state as usize)?)?;
            cost += backoff as f64;
            state = next;
        }
    }

    /// Natural log probability of a whole sentence, `</s>` included.
    /// Unknown words contribute `oov` each.
    pub fn sentence_log_prob(&self, words: &[&str], oov: f64) -> f64 {
        let mut state = self.start();
        let mut total = 0.0;
        for word in words {
            match self.label(word).and_then(|l| self.log_prob(state, l)) {
                Some((lp, next)) => {
                    total += lp;
                    state = next;
                }
                None => total += oov,
            }
        }
        total + self.final_log_prob(state).unwrap_or(oov)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn toy() -> NGramModel {
        NGramModel::read(PathBuf::from("testdata/toy.2.arpa")).unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn it_reads_an_arpa_model() {
        let model = toy();
        assert_eq!(model.order(), 2);
        assert_eq!(model.state_order(model.unigram_state()), 1);
        assert_eq!(model.state_order(model.start()), 2);
        assert!(model.label("cat").is_some());
        assert!(model.label("<eps>").is_none());
        assert!(model.label("zebra").is_none());
        let words: Vec<&str> = model.words().collect();
        assert!(words.contains(&"<s>"));
        assert!(words.contains(&"dog"));
    }

    #[test]
    fn it_scores_seen_bigrams() {
        let model = toy();
        let the = model.label("the").unwrap();
        let (lp, next) = model.log_prob(model.start(), the).unwrap();
        assert!(close(lp, -0.2 * std::f64::consts::LN_10));
        let cat = model.label("cat").unwrap();
        let (lp, _) = model.log_prob(next, cat).unwrap();
        assert!(close(lp, -0.3 * std::f64::consts::LN_10));
    }

    #[test]
    fn it_backs_off_for_unseen_bigrams() {
        let model = toy();
        let cat = model.label("cat").unwrap();
        // <s> cat is unseen: bow(<s>) + p(cat)
        let (lp, next) = model.log_prob(model.start(), cat).unwrap();
        assert!(close(lp, (-0.5 - 1.0) * std::f64::consts::LN_10));
        assert_eq!(model.state_order(next), 2);
    }

    #[test]
    fn it_scores_sentence_end() {
        let model = toy();
        let words = ["the", "cat"];
        let lp = model.sentence_log_prob(&words, -1000.0);
        let expected = (-0.2 - 0.3 - 0.1) * std::f64::consts::LN_10;
        assert!(close(lp, expected), "{} != {}", lp, expected);
    }

    #[test]
    fn it_round_trips_through_a_binary_fst() {
        let model = toy();
        let path = std::env::temp_dir().join(format!("toy-{}.fst", std::process::id()));
        model.fst().write(&path).unwrap();
        let reread = NGramModel::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(reread.order(), 2);
        let words = ["the", "dog", "sat"];
        assert!(close(
            reread.sentence_log_prob(&words, -1000.0),
            model.sentence_log_prob(&words, -1000.0)
        ));
    }

    #[test]
    fn it_rejects_fsts_without_symbols() {
        let mut fst = StdVectorFst::new();
        let s = fst.add_state();
        fst.set_start(s).unwrap();
        assert!(NGramModel::new(fst).is_err());
    }

    #[test]
    fn it_fails_on_missing_files() {
        assert!(NGramModel::read("testdata/does-not-exist.arpa").is_err());
    }
}
