//! Local replica of AMQP topic-exchange routing.
//!
//! Patterns are dot-separated words where `*` stands for exactly one word and
//! `#` for zero or more words. The router stores one value per pattern and
//! answers "which values match this topic" with each distinct value at most once.

use std::collections::{HashMap, HashSet};

pub const WORD_SEPARATOR: char = '.';
pub const WILDCARD_SINGLE: &str = "*";
pub const WILDCARD_MULTI: &str = "#";

const ROOT: usize = 0;

#[derive(Debug, Clone)]
struct TrieNode<T> {
    children: HashMap<String, usize>,
    /// Set only on nodes that terminate a registered pattern
    value: Option<T>,
    is_multi_wildcard: bool,
}

impl<T> TrieNode<T> {
    fn new(word: &str) -> Self {
        Self {
            children: HashMap::new(),
            value: None,
            is_multi_wildcard: word == WILDCARD_MULTI,
        }
    }
}

/// Trie of topic patterns, stored as an arena of nodes
#[derive(Debug, Clone)]
pub struct TopicRouter<T> {
    nodes: Vec<TrieNode<T>>,
    patterns: usize,
}

impl<T> Default for TopicRouter<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn split_words(topic: &str) -> Vec<&str> {
    if topic.is_empty() {
        Vec::new()
    } else {
        topic.split(WORD_SEPARATOR).collect()
    }
}

impl<T> TopicRouter<T> {
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::new("")],
            patterns: 0,
        }
    }

    /// Number of distinct patterns registered
    pub fn len(&self) -> usize {
        self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns == 0
    }

    /// Register `value` under `pattern`, replacing any value the pattern already had
    pub fn add(&mut self, pattern: &str, value: T) {
        let mut current = ROOT;
        for word in split_words(pattern) {
            current = match self.nodes[current].children.get(word) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(TrieNode::new(word));
                    self.nodes[current].children.insert(word.to_string(), child);
                    child
                }
            };
        }

        if self.nodes[current].value.replace(value).is_none() {
            self.patterns += 1;
        }
    }
}

impl<T: Clone + PartialEq> TopicRouter<T> {
    /// Return every distinct value whose pattern matches `topic`.
    ///
    /// The search walks `(node, consumed words)` states. Entering a `#` node does
    /// not consume a word (the zero-word case); staying on a `#` node consumes one
    /// more word. Each state is expanded once, so a `#` reachable along several
    /// paths is never re-explored. Values reached from several terminals are
    /// returned once.
    pub fn match_topic(&self, topic: &str) -> Vec<T> {
        let words = split_words(topic);
        let mut visited: HashSet<(usize, usize)> = HashSet::new();
        let mut results: Vec<T> = Vec::new();
        let mut stack = vec![(ROOT, 0usize)];

        while let Some((index, position)) = stack.pop() {
            if !visited.insert((index, position)) {
                continue;
            }
            let node = &self.nodes[index];

            if position == words.len() {
                if let Some(value) = &node.value {
                    if !results.contains(value) {
                        results.push(value.clone());
                    }
                }
            }

            if node.is_multi_wildcard && position < words.len() {
                stack.push((index, position + 1));
            }

            for (word, &child) in &node.children {
                if word == WILDCARD_MULTI {
                    stack.push((child, position));
                } else if position < words.len() && (word == WILDCARD_SINGLE || word == words[position]) {
                    stack.push((child, position + 1));
                }
            }
        }

        results
    }
}
