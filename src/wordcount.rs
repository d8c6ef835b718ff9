//! Word-count and letter-count over lines of text.
//!
//! One flat-map splits each line into lower-case words; its output feeds two
//! independent branches:
//!
//! ```text
//! source(input) -> flat_map_values(split_words) -+-> group_by(word)         -> count("word-counts")   -> to(word_topic)
//!                                                +-> group_by(first letter) -> count("letter-counts") -> to(letter_topic)
//! ```

use std::sync::OnceLock;

use regex::Regex;

use crate::error::Result;
use crate::graph::Topology;
use crate::graph_builder::{Produced, TopologyBuilder};

/// Namespace of the per-word counters.
pub const WORD_COUNTS: &str = "word-counts";
/// Namespace of the per-letter counters.
pub const LETTER_COUNTS: &str = "letter-counts";

fn non_word() -> &'static Regex {
  static NON_WORD: OnceLock<Regex> = OnceLock::new();
  NON_WORD.get_or_init(|| Regex::new(r"\W+").expect("static pattern compiles"))
}

/// Lower-cases `line` and splits it on runs of non-word characters.
/// Empty tokens are dropped.
pub fn split_words(line: &str) -> Vec<String> {
  non_word()
    .split(&line.to_lowercase())
    .filter(|w| !w.is_empty())
    .map(str::to_string)
    .collect()
}

/// The first character of `word`. Fails on an empty word.
pub fn first_letter(word: &str) -> std::result::Result<String, String> {
  word
    .chars()
    .next()
    .map(String::from)
    .ok_or_else(|| "cannot take the first letter of an empty word".to_string())
}

/// Builds the word-count topology.
pub fn topology(input: &str, word_topic: &str, letter_topic: &str) -> Result<Topology> {
  let builder = TopologyBuilder::new();
  builder.sink_topic(word_topic).sink_topic(letter_topic);

  let words = builder.source(input).flat_map_values(split_words);
  words
    .group_by(|_, word| word.to_string())
    .count_as(WORD_COUNTS)
    .to_stream()
    .to_with(word_topic, Produced::counts());
  words
    .try_group_by(|_, word| first_letter(word))
    .count_as(LETTER_COUNTS)
    .to_stream()
    .to_with(letter_topic, Produced::counts());

  builder.build()
}
