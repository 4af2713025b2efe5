use std::collections::HashMap;

use crate::error::Result;

/// Ordered list of output symbols, indexed by class id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    symbols: Vec<String>,
    index: HashMap<String, usize>,
}

impl Vocabulary {
    /// Parse a label spec holding one code point per class.
    ///
    /// The spec ends at the first NUL byte, if any; nothing after it is read.
    pub fn from_label_spec(spec: &[u8]) -> Result<Self> {
        let end = spec.iter().position(|&b| b == 0).unwrap_or(spec.len());
        let text = std::str::from_utf8(&spec[..end])?;
        Ok(Self::from_labels(text.chars().map(String::from)))
    }

    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let symbols: Vec<String> = labels.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(symbols.len());
        for (id, symbol) in symbols.iter().enumerate() {
            // first occurrence wins for duplicated symbols
            index.entry(symbol.clone()).or_insert(id);
        }
        Self { symbols, index }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbol(&self, id: usize) -> Option<&str> {
        self.symbols.get(id).map(String::as_str)
    }

    pub fn id_of(&self, symbol: &str) -> Option<usize> {
        self.index.get(symbol).copied()
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Concatenate the symbols of `tokens`, skipping ids outside the vocabulary.
    pub fn render(&self, tokens: &[usize]) -> String {
        tokens
            .iter()
            .filter_map(|&t| self.symbol(t))
            .collect::<Vec<_>>()
            .concat()
    }
}
