//! CCB identifiers and contact strings
//!
//! A target's contact string is `<broker-address>#<TargetId>`. The broker
//! address part is opaque to the broker itself; only the id after the last
//! `#` is used to route requests.

/// Broker-assigned identity of a registered target
pub type TargetId = u64;

/// Broker-assigned identity of an outstanding client request
pub type RequestId = u64;

/// Hands out ids in increasing order, skipping 0 and any id the caller
/// reports as taken. Wraps around at `u64::MAX`.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        IdAllocator { next: 1 }
    }

    /// Allocate the next free id.
    ///
    /// `taken` must leave at least one id free, otherwise this never returns.
    pub fn allocate(&mut self, taken: impl Fn(u64) -> bool) -> u64 {
        loop {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if id == 0 || taken(id) {
                continue;
            }
            return id;
        }
    }

    /// Make sure `id` will not be handed out again before wrapping.
    pub fn advance_past(&mut self, id: u64, margin: u64) {
        let floor = id.saturating_add(1).saturating_add(margin);
        if self.next < floor {
            self.next = floor;
        }
    }

    /// Next id that will be tried
    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the contact string a target hands out in place of its own address
pub fn contact_string(broker_address: &str, id: TargetId) -> String {
    format!("{}#{}", broker_address, id)
}

/// Split a contact string into (broker address, ccbid text) on the last `#`
pub fn split_contact(contact: &str) -> Option<(&str, &str)> {
    let (addr, id) = contact.rsplit_once('#')?;
    if addr.is_empty() || id.is_empty() {
        return None;
    }
    Some((addr, id))
}

/// Resolve a contact string, or a bare decimal id, to a TargetId
pub fn target_id_from_contact(contact: &str) -> Option<TargetId> {
    let id = match contact.rsplit_once('#') {
        Some((_, id)) => id,
        None => contact,
    };
    parse_id(id)
}

/// Parse a decimal id as carried on the wire
pub fn parse_id(text: &str) -> Option<u64> {
    text.trim().parse().ok()
}
