//! Suffix-matched domain trie.
//!
//! Labels are walked right to left, so `google.com` and `maps.google.com`
//! share the `com -> google` path. A leading `*` label matches one or more
//! labels: `*.example.com` covers `a.example.com` and `a.b.example.com` but
//! not `example.com` itself.

use std::collections::HashMap;

use crate::error::{Error, Result};

const WILDCARD: &str = "*";

#[derive(Debug)]
struct Node<T> {
    children: HashMap<String, Node<T>>,
    data: Option<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            data: None,
        }
    }
}

#[derive(Debug)]
pub struct DomainTrie<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for DomainTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DomainTrie<T> {
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, domain: &str, data: T) -> Result<()> {
        let labels = validate(domain)?;
        let mut node = &mut self.root;
        for label in labels.iter().rev() {
            node = node
                .children
                .entry((*label).to_string())
                .or_insert_with(Node::new);
        }
        if node.data.is_none() {
            self.len += 1;
        }
        node.data = Some(data);
        Ok(())
    }

    /// Longest-suffix lookup.
    pub fn search(&self, domain: &str) -> Option<&T> {
        let domain = domain.trim_end_matches('.');
        if domain.is_empty() {
            return None;
        }
        let labels: Vec<&str> = domain.split('.').collect();
        if labels.iter().any(|l| l.is_empty()) {
            return None;
        }
        Self::walk(&self.root, &labels)
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.search(domain).is_some()
    }

    fn walk<'a>(node: &'a Node<T>, labels: &[&str]) -> Option<&'a T> {
        let Some((last, rest)) = labels.split_last() else {
            return node.data.as_ref();
        };
        if let Some(child) = node.children.get(*last) {
            if let Some(found) = Self::walk(child, rest) {
                return Some(found);
            }
        }
        // wildcard consumes every remaining label, but at least one
        node.children
            .get(WILDCARD)
            .and_then(|child| child.data.as_ref())
    }
}

fn validate(domain: &str) -> Result<Vec<&str>> {
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() {
        return Err(Error::InvalidDomain(domain.to_string()));
    }
    let labels: Vec<&str> = domain.split('.').collect();
    for (i, label) in labels.iter().enumerate() {
        if label.is_empty() {
            return Err(Error::InvalidDomain(domain.to_string()));
        }
        if *label == WILDCARD && i != 0 {
            return Err(Error::InvalidDomain(domain.to_string()));
        }
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_insert_search() {
        let mut trie = DomainTrie::new();
        trie.insert("example.com", 1).unwrap();
        assert_eq!(trie.search("example.com"), Some(&1));
        assert_eq!(trie.search("www.example.com"), None);
        assert_eq!(trie.search("example.org"), None);
    }

    #[test]
    fn wildcard_matches_one_or_more_labels() {
        let mut trie = DomainTrie::new();
        trie.insert("*.example.com", ()).unwrap();
        assert!(trie.contains("a.example.com"));
        assert!(trie.contains("a.b.example.com"));
        assert!(!trie.contains("example.com"));
    }

    #[test]
    fn longest_suffix_wins() {
        let mut trie = DomainTrie::new();
        trie.insert("*.google.com", "wild").unwrap();
        trie.insert("maps.google.com", "exact").unwrap();
        assert_eq!(trie.search("maps.google.com"), Some(&"exact"));
        assert_eq!(trie.search("mail.google.com"), Some(&"wild"));
    }

    #[test]
    fn rejects_malformed_domains() {
        let mut trie: DomainTrie<()> = DomainTrie::new();
        assert!(trie.insert("", ()).is_err());
        assert!(trie.insert("a..b", ()).is_err());
        assert!(trie.insert("a.*.com", ()).is_err());
    }

    #[test]
    fn trailing_dot_is_tolerated() {
        let mut trie = DomainTrie::new();
        trie.insert("example.com.", 7).unwrap();
        assert_eq!(trie.search("example.com"), Some(&7));
    }
}
