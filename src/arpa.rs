use anyhow::{anyhow, Context, Result};
use rustfst::prelude::*;
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;

use crate::model::{BOS, EOS};
use crate::StdVectorFst;

/// Scale from log10 (ARPA) to natural log (tropical weights are -ln p)
const LN_10: f32 = std::f32::consts::LN_10;

/// One entry of an ARPA n-gram section
#[derive(Debug)]
struct ArpaEntry {
    /// log10 probability
    log_prob: f32,
    /// Words of the n-gram, oldest first
    words: Vec<String>,
    /// log10 backoff weight, if present
    backoff: Option<f32>,
}

#[derive(Debug, PartialEq)]
enum Section {
    Preamble,
    Data,
    NGrams(usize),
    End,
}

fn parse_sections<R: BufRead>(reader: R) -> Result<Vec<Vec<ArpaEntry>>> {
    let mut section = Section::Preamble;
    let mut declared: Vec<usize> = Vec::new();
    let mut orders: Vec<Vec<ArpaEntry>> = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "\\data\\" {
            section = Section::Data;
            continue;
        }
        if line == "\\end\\" {
            section = Section::End;
            break;
        }
        if let Some(order) = line
            .strip_prefix('\\')
            .and_then(|l| l.strip_suffix("-grams:"))
        {
            let order: usize = order
                .parse()
                .with_context(|| format!("line {}: bad section header {:?}", lineno + 1, line))?;
            if order != orders.len() + 1 {
                return Err(anyhow!(
                    "line {}: expected {}-grams section, found {}-grams",
                    lineno + 1,
                    orders.len() + 1,
                    order
                ));
            }
            orders.push(Vec::new());
            section = Section::NGrams(order);
            continue;
        }
        match section {
            Section::Preamble => {}
            Section::Data => {
                let count = line
                    .strip_prefix("ngram ")
                    .and_then(|l| l.split_once('='))
                    .and_then(|(_, count)| count.trim().parse().ok())
                    .ok_or_else(|| anyhow!("line {}: bad count line {:?}", lineno + 1, line))?;
                declared.push(count);
            }
            Section::NGrams(order) => {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() != order + 1 && fields.len() != order + 2 {
                    return Err(anyhow!(
                        "line {}: {}-gram entry has {} fields",
                        lineno + 1,
                        order,
                        fields.len()
                    ));
                }
                let log_prob: f32 = fields[0]
                    .parse()
                    .with_context(|| format!("line {}: bad probability", lineno + 1))?;
                let backoff = match fields.get(order + 1) {
                    Some(bow) => Some(
                        bow.parse()
                            .with_context(|| format!("line {}: bad backoff", lineno + 1))?,
                    ),
                    None => None,
                };
                orders[order - 1].push(ArpaEntry {
                    log_prob,
                    words: fields[1..=order].iter().map(|w| w.to_string()).collect(),
                    backoff,
                });
            }
            Section::End => break,
        }
    }
    if section != Section::End {
        return Err(anyhow!("missing \\end\\ marker"));
    }
    if orders.is_empty() {
        return Err(anyhow!("no n-gram sections"));
    }
    for (i, entries) in orders.iter().enumerate() {
        if let Some(&count) = declared.get(i) {
            if count != entries.len() {
                return Err(anyhow!(
                    "header declares {} {}-grams but {} were read",
                    count,
                    i + 1,
                    entries.len()
                ));
            }
        }
    }
    Ok(orders)
}

/// Find the state of the longest suffix of `context` that has one,
/// falling back to the unigram state.
fn suffix_state(
    contexts: &HashMap<Vec<Label>, StateId>,
    context: &[Label],
    unigram: StateId,
) -> StateId {
    (0..context.len())
        .find_map(|start| contexts.get(&context[start..]).copied())
        .unwrap_or(unigram)
}

/// Convert an ARPA backoff language model to a backoff FST.
///
/// The result follows the OpenGRM layout: one state per n-gram context,
/// epsilon arcs to the backoff state, `</s>` as final weight and the `<s>`
/// context as start state. Weights are `-ln p`.
pub fn read_arpa<R: BufRead>(reader: R) -> Result<StdVectorFst> {
    let orders = parse_sections(reader)?;
    let hi_order = orders.len();

    let mut syms = SymbolTable::new();
    for entry in &orders[0] {
        syms.add_symbol(entry.words[0].as_str());
    }
    let labels_of = |words: &[String]| -> Result<Vec<Label>> {
        words
            .iter()
            .map(|w| {
                syms.get_label(w)
                    .ok_or_else(|| anyhow!("word {:?} missing from 1-grams", w))
            })
            .collect()
    };
    let eos = syms.get_label(EOS);
    let bos = syms.get_label(BOS);

    let mut fst = StdVectorFst::new();
    let unigram = fst.add_state();
    let mut contexts = HashMap::<Vec<Label>, StateId>::new();
    // States for every context that can be extended, lowest orders first so
    // that backoff targets exist when we need them.
    let mut context_backoffs = Vec::<(Vec<Label>, StateId, f32)>::new();
    for entries in orders.iter().take(hi_order - 1) {
        for entry in entries {
            let context = labels_of(&entry.words)?;
            if context.last().copied() == eos {
                continue;
            }
            let state = fst.add_state();
            contexts.insert(context.clone(), state);
            context_backoffs.push((context, state, entry.backoff.unwrap_or(0.0)));
        }
    }
    for (context, state, backoff) in &context_backoffs {
        let backoff_state = suffix_state(&contexts, &context[1..], unigram);
        fst.add_tr(
            *state,
            Tr::new(EPS_LABEL, EPS_LABEL, -backoff * LN_10, backoff_state),
        )?;
    }

    for (k, entries) in orders.iter().enumerate() {
        let order = k + 1;
        for entry in entries {
            let ngram = labels_of(&entry.words)?;
            let (&label, history) = ngram
                .split_last()
                .ok_or_else(|| anyhow!("empty {}-gram", order))?;
            let origin = if history.is_empty() {
                unigram
            } else {
                *contexts.get(history).ok_or_else(|| {
                    anyhow!("history of {}-gram {:?} is missing", order, entry.words)
                })?
            };
            let cost = -entry.log_prob * LN_10;
            if Some(label) == eos {
                fst.set_final(origin, cost)?;
            } else if Some(label) == bos {
                // <s> is only ever a context, never predicted
                continue;
            } else {
                let destination = if order < hi_order {
                    suffix_state(&contexts, &ngram, unigram)
                } else {
                    suffix_state(&contexts, &ngram[1..], unigram)
                };
                fst.add_tr(origin, Tr::new(label, label, cost, destination))?;
            }
        }
    }

    let start = bos
        .and_then(|bos| contexts.get(&vec![bos]).copied())
        .unwrap_or(unigram);
    fst.set_start(start)?;
    tr_sort(&mut fst, ILabelCompare {});
    let syms = Arc::new(syms);
    fst.set_input_symbols(Arc::clone(&syms));
    fst.set_output_symbols(syms);
    Ok(fst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustfst::semirings::Semiring;
    use std::io::Cursor;

    const TOY: &str = "\\data\\
ngram 1=4
ngram 2=3

\\1-grams:
-1.0 <s> -0.5
-0.5 </s>
-0.3 a -0.2
-0.6 b

\\2-grams:
-0.1 <s> a
-0.4 a b
-0.2 a </s>

\\end\\
";

    #[test]
    fn it_parses_sections() {
        let orders = parse_sections(Cursor::new(TOY)).unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].len(), 4);
        assert_eq!(orders[0][0].backoff, Some(-0.5));
        assert_eq!(orders[0][3].backoff, None);
        assert_eq!(orders[1][1].words, vec!["a", "b"]);
    }

    #[test]
    fn it_builds_a_backoff_fst() {
        let fst = read_arpa(Cursor::new(TOY)).unwrap();
        // unigram, <s>, a, b (</s> is never a context)
        assert_eq!(fst.num_states(), 4);
        let syms = fst.input_symbols().unwrap();
        assert_eq!(syms.get_label("a"), Some(3));
        let start = fst.start().unwrap();
        let trs = fst.get_trs(start).unwrap();
        let trs = trs.trs();
        assert_eq!(trs[0].ilabel, EPS_LABEL);
        assert!((trs[0].weight.value() - 0.5 * LN_10).abs() < 1e-5);
        assert_eq!(trs[1].ilabel, 3);
        assert!((trs[1].weight.value() - 0.1 * LN_10).abs() < 1e-5);
    }

    #[test]
    fn it_rejects_count_mismatch() {
        let broken = TOY.replace("ngram 2=3", "ngram 2=5");
        assert!(read_arpa(Cursor::new(broken)).is_err());
    }

    #[test]
    fn it_rejects_missing_end() {
        let broken = TOY.replace("\\end\\", "");
        assert!(read_arpa(Cursor::new(broken)).is_err());
    }

    #[test]
    fn it_rejects_unknown_words() {
        let broken = TOY.replace("-0.4 a b", "-0.4 a c");
        assert!(read_arpa(Cursor::new(broken)).is_err());
    }
}
