//! Peer registry: connected peers, their addresses and advertised ports.
//!
//! Ids are generation-checked slot handles: removing a peer retires its id, so
//! an id held across a removal resolves to nothing instead of another peer.

use std::net::IpAddr;

use crate::protocol::PeerAddress;
use crate::reassembly::Reassembler;

/// Handle to a registry slot. Valid until the peer is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    index: u32,
    generation: u32,
}

impl PeerId {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// One connected peer.
#[derive(Debug)]
pub struct PeerRecord<C> {
    pub id: PeerId,
    pub conn: C,
    pub address: String,
    /// Advertised listening port; None until the peer's Hello arrives.
    pub port: Option<u16>,
    pub reassembler: Reassembler,
}

impl<C> PeerRecord<C> {
    /// Reconnection target, once the advertised port is known.
    pub fn peer_address(&self) -> Option<PeerAddress> {
        self.port.map(|port| PeerAddress::new(self.address.clone(), port))
    }
}

struct Slot<C> {
    generation: u32,
    record: Option<PeerRecord<C>>,
}

/// Directory of connected peers. Iteration is in slot order.
pub struct PeerRegistry<C> {
    slots: Vec<Slot<C>>,
    free: Vec<u32>,
    len: usize,
}

impl<C> PeerRegistry<C> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Register a new connection; the port stays unknown until `update_port`.
    pub fn add(&mut self, conn: C, address: impl Into<String>) -> PeerId {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    record: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = PeerId {
            index,
            generation: slot.generation,
        };
        slot.record = Some(PeerRecord {
            id,
            conn,
            address: address.into(),
            port: None,
            reassembler: Reassembler::new(),
        });
        self.len += 1;
        id
    }

    /// Remove a batch of peers. Unknown or stale ids are skipped. Returns the removed records.
    pub fn remove(&mut self, ids: &[PeerId]) -> Vec<PeerRecord<C>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            let Some(slot) = self.slots.get_mut(id.index as usize) else {
                continue;
            };
            if slot.generation != id.generation {
                continue;
            }
            if let Some(record) = slot.record.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
                self.len -= 1;
                out.push(record);
            }
        }
        out
    }

    /// Record the advertised port. Returns false for a stale id.
    pub fn update_port(&mut self, id: PeerId, port: u16) -> bool {
        match self.get_mut(id) {
            Some(record) => {
                record.port = Some(port);
                true
            }
            None => false,
        }
    }

    /// Find a connected peer by address and advertised port.
    pub fn find(&self, address: &str, port: u16) -> Option<PeerId> {
        self.iter()
            .find(|r| r.port == Some(port) && addresses_equal(&r.address, address))
            .map(|r| r.id)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerRecord<C>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_ref()
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerRecord<C>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_mut()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord<C>> {
        self.slots.iter().filter_map(|s| s.record.as_ref())
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.iter().map(|r| r.id).collect()
    }

    /// Reachable addresses of every peer with a known port, except `except`.
    pub fn known_addresses(&self, except: Option<PeerId>) -> Vec<PeerAddress> {
        self.iter()
            .filter(|r| Some(r.id) != except)
            .filter_map(|r| r.peer_address())
            .collect()
    }
}

impl<C> Default for PeerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare two textual addresses, treating `::ffff:a.b.c.d` as `a.b.c.d`.
pub fn addresses_equal(a: &str, b: &str) -> bool {
    a == b || normalize(a) == normalize(b)
}

fn normalize(addr: &str) -> String {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(ip) => ip.to_string(),
        Err(_) => addr.to_owned(),
    }
}
