use anyhow::Result;
use rustfst::prelude::*;
use rustfst::semirings::Semiring;

use crate::vocab::Vocabulary;
use crate::StdVectorFst;

/// Spelling dictionary: a trie-shaped acceptor over class labels.
///
/// Arc labels are class ids shifted by one, since label 0 is epsilon.
/// Final states end a complete word.
#[derive(Debug)]
pub struct Lexicon {
    /// Deterministic acceptor, arcs sorted by input label
    fst: StdVectorFst,
    /// Number of distinct words accepted
    num_words: usize,
}

/// Split `word` into class ids by greedy longest match on the vocabulary.
fn spell(word: &str, vocab: &Vocabulary) -> Option<Vec<usize>> {
    let mut ids = Vec::new();
    let mut rest = word;
    while !rest.is_empty() {
        let symbol = vocab
            .symbols()
            .iter()
            .filter(|s| !s.is_empty() && rest.starts_with(s.as_str()))
            .max_by_key(|s| s.len())?;
        ids.push(vocab.id_of(symbol)?);
        rest = &rest[symbol.len()..];
    }
    Some(ids)
}

fn class_label(class: usize) -> Label {
    class as Label + 1
}

impl Lexicon {
    /// Build from the words of a language model.
    ///
    /// Words that cannot be spelled with `vocab`, or that contain a symbol
    /// for which `is_boundary` holds, are skipped.
    pub fn new<'a, I, F>(words: I, vocab: &Vocabulary, is_boundary: F) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
        F: Fn(&str) -> bool,
    {
        let mut fst = StdVectorFst::new();
        let root = fst.add_state();
        fst.set_start(root)?;
        let mut num_words = 0;
        for word in words {
            let Some(ids) = spell(word, vocab) else {
                continue;
            };
            if ids.is_empty()
                || ids
                    .iter()
                    .any(|&id| vocab.symbol(id).map_or(true, |s| is_boundary(s)))
            {
                continue;
            }
            let mut state = root;
            for id in ids {
                let label = class_label(id);
                let existing = fst
                    .get_trs(state)?
                    .trs()
                    .iter()
                    .find(|tr| tr.ilabel == label)
                    .map(|tr| tr.nextstate);
                state = match existing {
                    Some(next) => next,
                    None => {
                        let next = fst.add_state();
                        fst.add_tr(state, Tr::new(label, label, TropicalWeight::one(), next))?;
                        next
                    }
                };
            }
            if !fst.is_final(state)? {
                fst.set_final(state, TropicalWeight::one())?;
                num_words += 1;
            }
        }
        tr_sort(&mut fst, ILabelCompare {});
        Ok(Self { fst, num_words })
    }

    pub fn start(&self) -> StateId {
        // set in new()
        self.fst.start().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.num_words
    }

    pub fn is_empty(&self) -> bool {
        self.num_words == 0
    }

    /// Follow `class` from `state`; `None` leaves the dictionary.
    pub fn step(&self, state: StateId, class: usize) -> Option<StateId> {
        let label = class_label(class);
        let trs = self.fst.get_trs(state).ok()?;
        let trs = trs.trs();
        trs.binary_search_by_key(&label, |tr| tr.ilabel)
            .ok()
            .map(|idx| trs[idx].nextstate)
    }

    /// Whether `state` completes a word.
    pub fn is_word_end(&self, state: StateId) -> bool {
        self.fst.is_final(state).unwrap_or(false)
    }

    pub fn fst(&self) -> &StdVectorFst {
        &self.fst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        Vocabulary::from_labels(["_", " ", "a", "c", "t", "s"])
    }

    fn walk(lex: &Lexicon, classes: &[usize]) -> Option<StateId> {
        classes
            .iter()
            .try_fold(lex.start(), |state, &c| lex.step(state, c))
    }

    #[test]
    fn it_builds_a_trie() {
        let vocab = vocab();
        let words = ["cat", "cats", "at", "act", "cat"];
        let lex = Lexicon::new(words, &vocab, |s| s == " ").unwrap();
        assert_eq!(lex.len(), 4);
        // c-a-t shares a prefix with c-a-t-s
        let cat = walk(&lex, &[3, 2, 4]).unwrap();
        assert!(lex.is_word_end(cat));
        let ca = walk(&lex, &[3, 2]).unwrap();
        assert!(!lex.is_word_end(ca));
        assert!(lex.is_word_end(walk(&lex, &[3, 2, 4, 5]).unwrap()));
        assert!(walk(&lex, &[4, 2]).is_none());
    }

    #[test]
    fn it_skips_unspellable_words() {
        let vocab = vocab();
        let words = ["dog", "<s>", "a c", "dot"];
        let lex = Lexicon::new(words, &vocab, |s| s == " ").unwrap();
        assert_eq!(lex.len(), 0);
        assert!(lex.is_empty());
    }

    #[test]
    fn it_matches_longest_symbols() {
        let vocab = Vocabulary::from_labels(["_", "t", "th", "e"]);
        assert_eq!(spell("the", &vocab), Some(vec![2, 3]));
        assert_eq!(spell("tt", &vocab), Some(vec![1, 1]));
        assert_eq!(spell("x", &vocab), None);
    }
}
