//! The nonce registry: tracks the 64-bit nonces this node has advertised in
//! outgoing `version` messages, so an inbound peer that echoes one back can
//! be recognized as a connection to ourselves.
use std::collections::HashSet;

/// A set of nonces currently in flight, one per live connecting/handshaking
/// peer. Every `CONNECTING`/`WAIT_*`/`CONNECTED` peer owns exactly one
/// member; it's removed once the remote's version has been processed or the
/// peer dies.
#[derive(Debug, Default)]
pub struct NonceRegistry {
    nonces: HashSet<u64>,
}

impl NonceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a fresh nonce not currently in the set, using the given RNG,
    /// and record it.
    pub fn alloc(&mut self, rng: &mut impl crate::collaborators::Rng) -> u64 {
        loop {
            let nonce = rng.next_u64();
            if nonce != 0 && self.nonces.insert(nonce) {
                return nonce;
            }
        }
    }

    /// Whether a nonce is currently registered.
    pub fn has(&self, nonce: u64) -> bool {
        self.nonces.contains(&nonce)
    }

    /// Remove a nonce from the set.
    pub fn remove(&mut self, nonce: u64) -> bool {
        self.nonces.remove(&nonce)
    }

    /// Number of nonces currently tracked.
    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_never_returns_a_duplicate() {
        let mut registry = NonceRegistry::new();
        let mut rng = fastrand::Rng::with_seed(1);
        let a = registry.alloc(&mut rng);
        let b = registry.alloc(&mut rng);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_drops_membership() {
        let mut registry = NonceRegistry::new();
        let mut rng = fastrand::Rng::with_seed(7);
        let nonce = registry.alloc(&mut rng);
        assert!(registry.has(nonce));
        assert!(registry.remove(nonce));
        assert!(!registry.has(nonce));
    }
}
