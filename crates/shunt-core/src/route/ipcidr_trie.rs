//! 256-ary byte-wise trie over IPv4 octets.
//!
//! A CIDR whose prefix is not octet-aligned is split at insert time into the
//! union of /8-aligned prefixes covering it, so lookups never mask bits: they
//! just walk octets until a terminal node. Once a node is terminal all of its
//! descendants are pruned; a broader block swallows narrower ones.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

#[derive(Debug)]
struct Node {
    terminal: bool,
    children: [Option<Box<Node>>; 256],
}

impl Node {
    fn new() -> Self {
        Self {
            terminal: false,
            children: std::array::from_fn(|_| None),
        }
    }

    fn mark_terminal(&mut self) {
        self.terminal = true;
        self.children = std::array::from_fn(|_| None);
    }

    fn child_mut(&mut self, octet: u8) -> &mut Node {
        self.children[octet as usize].get_or_insert_with(|| Box::new(Node::new()))
    }
}

#[derive(Debug)]
pub struct IpCidrTrie {
    root: Node,
}

impl Default for IpCidrTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl IpCidrTrie {
    pub fn new() -> Self {
        Self { root: Node::new() }
    }

    pub fn insert_str(&mut self, cidr: &str) -> Result<()> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|_| Error::InvalidIpCidr(cidr.to_string()))?;
        self.insert(net);
        Ok(())
    }

    pub fn insert(&mut self, net: Ipv4Net) {
        let octets = net.network().octets();
        let prefix = net.prefix_len();
        if prefix == 0 {
            self.root.mark_terminal();
            return;
        }

        let full = (prefix / 8) as usize;
        let rem = prefix % 8;

        let mut node = &mut self.root;
        for &octet in &octets[..full] {
            if node.terminal {
                return;
            }
            node = node.child_mut(octet);
        }
        if node.terminal {
            return;
        }

        if rem == 0 {
            node.mark_terminal();
            return;
        }

        // expand the partial octet into its /8-aligned union
        let mask = 0xffu8 << (8 - rem);
        let base = octets[full] & mask;
        for value in base..=base | !mask {
            node.child_mut(value).mark_terminal();
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mut node = &self.root;
        if node.terminal {
            return true;
        }
        for octet in ip.octets() {
            match &node.children[octet as usize] {
                Some(child) => {
                    if child.terminal {
                        return true;
                    }
                    node = child;
                }
                None => return false,
            }
        }
        false
    }

    pub fn contains_str(&self, ip: &str) -> bool {
        ip.parse::<Ipv4Addr>()
            .map(|ip| self.contains(ip))
            .unwrap_or(false)
    }
}
