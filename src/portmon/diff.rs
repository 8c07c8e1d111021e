use std::collections::BTreeSet;

/// Ports that appeared and disappeared between two samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDelta {
    pub opened: Vec<u16>,
    pub closed: Vec<u16>,
}

impl PortDelta {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }
}

/// `opened = current - previous`, `closed = previous - current`.
pub fn diff_ports(previous: &BTreeSet<u16>, current: &BTreeSet<u16>) -> PortDelta {
    PortDelta {
        opened: current.difference(previous).copied().collect(),
        closed: previous.difference(current).copied().collect(),
    }
}
