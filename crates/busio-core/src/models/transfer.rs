//! Outgoing transfers and transfer-ID sequencing

use bytes::Bytes;

use super::session::{Priority, SessionSpecifier};

/// A transfer injected on behalf of another node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlienTransfer {
    pub priority: Priority,
    pub transfer_id: u64,
    pub session: SessionSpecifier,
    pub payload: Bytes,
}

/// Monotonic transfer-ID source for one session specifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferIdCounter {
    value: u64,
}

impl TransferIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, without advancing
    pub fn peek(&self) -> u64 {
        self.value
    }

    pub fn get_then_increment(&mut self) -> u64 {
        let out = self.value;
        self.value = self.value.wrapping_add(1);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_sequence() {
        let mut c = TransferIdCounter::new();
        assert_eq!(c.get_then_increment(), 0);
        assert_eq!(c.get_then_increment(), 1);
        assert_eq!(c.peek(), 2);
    }
}
