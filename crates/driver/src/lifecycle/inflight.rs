//! Bookkeeping for transfers between submit and completion

use crate::usb::transport::{CompletionToken, EndpointKind};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub(crate) struct InFlight {
    pub kind: EndpointKind,
    pub cancel_requested: bool,
    /// Gave up waiting for this one during a drain
    pub leaked: bool,
}

#[derive(Debug, Default)]
pub(crate) struct InFlightTable {
    entries: HashMap<CompletionToken, InFlight>,
}

impl InFlightTable {
    pub fn insert(&mut self, token: CompletionToken, kind: EndpointKind) {
        self.entries.insert(
            token,
            InFlight {
                kind,
                cancel_requested: false,
                leaked: false,
            },
        );
    }

    pub fn remove(&mut self, token: CompletionToken) -> Option<InFlight> {
        self.entries.remove(&token)
    }

    /// Transfers still expected to complete (leaked ones excluded)
    pub fn active(&self) -> usize {
        self.entries.values().filter(|e| !e.leaked).count()
    }

    /// Live receives that count toward the receive target
    pub fn live_receives(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.kind == EndpointKind::BulkIn && !e.cancel_requested && !e.leaked)
            .count()
    }

    pub fn count(&self, kind: EndpointKind) -> usize {
        self.entries.values().filter(|e| e.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark every transfer not yet cancelled; returns their tokens in
    /// submission order
    pub fn take_uncancelled(&mut self) -> Vec<CompletionToken> {
        let mut tokens: Vec<_> = self
            .entries
            .iter_mut()
            .filter(|(_, e)| !e.cancel_requested)
            .map(|(token, e)| {
                e.cancel_requested = true;
                *token
            })
            .collect();
        tokens.sort();
        tokens
    }

    /// Flag everything still pending as leaked; returns how many were newly
    /// flagged
    pub fn mark_leaked(&mut self) -> usize {
        let mut newly = 0;
        for entry in self.entries.values_mut().filter(|e| !e.leaked) {
            entry.leaked = true;
            newly += 1;
        }
        newly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_then_leak() {
        let mut table = InFlightTable::default();
        table.insert(CompletionToken(2), EndpointKind::BulkIn);
        table.insert(CompletionToken(1), EndpointKind::BulkIn);
        table.insert(CompletionToken(3), EndpointKind::BulkOut);
        assert_eq!(table.live_receives(), 2);

        let tokens = table.take_uncancelled();
        assert_eq!(
            tokens,
            vec![CompletionToken(1), CompletionToken(2), CompletionToken(3)]
        );
        assert!(table.take_uncancelled().is_empty());
        assert_eq!(table.live_receives(), 0);
        assert_eq!(table.active(), 3);

        table.remove(CompletionToken(1));
        assert_eq!(table.mark_leaked(), 2);
        assert_eq!(table.active(), 0);
        assert_eq!(table.len(), 2);
        assert_eq!(table.mark_leaked(), 0);
    }
}
