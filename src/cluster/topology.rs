//! Slot hashing and the slot→node topology parsed from `CLUSTER SLOTS`.
use std::collections::HashMap;

use crate::types::{ErrorKind, RedisError, RedisResult, Value};

/// Total number of hash slots in a Redis Cluster.
pub const SLOT_COUNT: u16 = 16384;

/// Whether a node is a slot's master or one of its replicas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerType {
    Master,
    Replica,
}

/// One cluster node, keyed elsewhere by its `host:port` address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub host: String,
    pub port: u16,
    pub server_type: ServerType,
    pub node_id: Option<String>,
}

impl NodeDescriptor {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The slot→node mapping, refreshed wholesale on `MOVED`/startup and
/// swapped in atomically by the caller (see [`crate::cluster::ClusterClient`]).
#[derive(Clone, Debug, Default)]
pub struct SlotMap {
    /// `slots[slot]` is `(master, replicas)`, populated only for covered
    /// slots; an absent entry means the slot is not currently served.
    slots: HashMap<u16, (NodeDescriptor, Vec<NodeDescriptor>)>,
}

impl SlotMap {
    pub fn new() -> Self {
        SlotMap { slots: HashMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Inserts every slot in `[start, end]` covered by one `CLUSTER SLOTS`
    /// row.
    pub fn insert_range(&mut self, start: u16, end: u16, master: NodeDescriptor, replicas: Vec<NodeDescriptor>) {
        for slot in start..=end {
            self.slots.insert(slot, (master.clone(), replicas.clone()));
        }
    }

    pub fn master_for_slot(&self, slot: u16) -> Option<&NodeDescriptor> {
        self.slots.get(&slot).map(|(master, _)| master)
    }

    /// A master or, if `readonly` and replicas exist, a replica chosen at
    /// random — redis-py's `read_from_replicas` policy.
    pub fn owner_for_slot(&self, slot: u16, readonly: bool) -> Option<&NodeDescriptor> {
        let (master, replicas) = self.slots.get(&slot)?;
        if readonly && !replicas.is_empty() {
            use rand::Rng;
            let idx = rand::thread_rng().gen_range(0..replicas.len() + 1);
            if idx == replicas.len() {
                Some(master)
            } else {
                Some(&replicas[idx])
            }
        } else {
            Some(master)
        }
    }

    /// Every distinct node address currently referenced by the topology
    /// (masters and replicas), used to build/prune the per-node pool map.
    pub fn node_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .slots
            .values()
            .flat_map(|(master, replicas)| std::iter::once(master).chain(replicas.iter()))
            .map(NodeDescriptor::addr)
            .collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    /// Every distinct master address, the fan-out target for keyless
    /// admin commands like `KEYS`.
    pub fn master_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.slots.values().map(|(master, _)| master.addr()).collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }
}

/// Extracts the hash-tag substring (`{tag}`) if present and non-empty,
/// otherwise hashes the whole key, per the standard Redis Cluster rule.
fn hash_target(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(rel_close) = key[open + 1..].iter().position(|&b| b == b'}') {
            if rel_close > 0 {
                return &key[open + 1..open + 1 + rel_close];
            }
        }
    }
    key
}

/// Maps a key to its slot (0..16384) via CRC16/XMODEM over the hash-tag
/// or whole key, modulo the slot count.
pub fn key_slot(key: &[u8]) -> u16 {
    let target = hash_target(key);
    crc16::State::<crc16::XMODEM>::calculate(target) % SLOT_COUNT
}

/// Computes the single slot shared by every key, or `None` if `keys` is
/// empty, or an error if the keys don't all hash to the same slot.
pub fn slot_for_keys(keys: &[&[u8]]) -> RedisResult<Option<u16>> {
    let mut slot = None;
    for key in keys {
        let this_slot = key_slot(key);
        match slot {
            None => slot = Some(this_slot),
            Some(s) if s == this_slot => {}
            Some(_) => {
                return Err(RedisError::from((ErrorKind::CrossSlot, "keys in one request hash to more than one slot")));
            }
        }
    }
    Ok(slot)
}

/// Parses the reply of `CLUSTER SLOTS` into a fresh [`SlotMap`].
pub fn parse_cluster_slots(value: &Value) -> RedisResult<SlotMap> {
    let rows = value
        .as_bulk()
        .ok_or_else(|| RedisError::from((ErrorKind::ResponseError, "CLUSTER SLOTS reply was not an array")))?;

    let mut map = SlotMap::new();
    for row in rows {
        let row = row
            .as_bulk()
            .ok_or_else(|| RedisError::from((ErrorKind::ResponseError, "CLUSTER SLOTS row was not an array")))?;
        if row.len() < 3 {
            continue;
        }
        let start = match &row[0] {
            Value::Int(n) => *n as u16,
            _ => continue,
        };
        let end = match &row[1] {
            Value::Int(n) => *n as u16,
            _ => continue,
        };

        let mut nodes = Vec::new();
        for (i, entry) in row[2..].iter().enumerate() {
            let fields = match entry.as_bulk() {
                Some(fields) if fields.len() >= 2 => fields,
                _ => continue,
            };
            let host = match fields[0].as_data() {
                Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                None => continue,
            };
            if host.is_empty() {
                continue;
            }
            let port = match &fields[1] {
                Value::Int(n) => *n as u16,
                _ => continue,
            };
            let node_id = fields.get(2).and_then(Value::as_data).map(|b| String::from_utf8_lossy(b).into_owned());
            nodes.push(NodeDescriptor {
                host,
                port,
                server_type: if i == 0 { ServerType::Master } else { ServerType::Replica },
                node_id,
            });
        }
        if nodes.is_empty() {
            continue;
        }
        let master = nodes.remove(0);
        map.insert_range(start, end, master, nodes);
    }

    if map.is_empty() {
        return Err(RedisError::from((ErrorKind::ResponseError, "CLUSTER SLOTS reply covered no slots")));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_whole_key_without_a_tag() {
        assert_eq!(key_slot(b"foo"), crc16::State::<crc16::XMODEM>::calculate(b"foo") % SLOT_COUNT);
    }

    #[test]
    fn hash_tag_overrides_the_whole_key() {
        assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"{user1000}.followers"));
        assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"user1000"));
    }

    #[test]
    fn empty_hash_tag_falls_back_to_whole_key() {
        // `{}foo` has no non-empty tag between the braces, so the whole
        // string (braces included) is hashed, not just `foo`.
        assert_eq!(key_slot(b"{}foo"), crc16::State::<crc16::XMODEM>::calculate(b"{}foo") % SLOT_COUNT);
    }

    #[test]
    fn slot_for_keys_detects_cross_slot() {
        assert!(slot_for_keys(&[b"{a}1", b"{a}2"]).unwrap().is_some());
        assert_eq!(slot_for_keys(&[b"{a}1", b"{b}2"]).unwrap_err().kind(), ErrorKind::CrossSlot);
    }

    #[test]
    fn parses_cluster_slots_reply_into_a_full_topology() {
        let reply = Value::Bulk(vec![
            Value::Bulk(vec![
                Value::Int(0),
                Value::Int(8191),
                Value::Bulk(vec![Value::Data(b"10.0.0.1".to_vec()), Value::Int(6379)]),
                Value::Bulk(vec![Value::Data(b"10.0.0.2".to_vec()), Value::Int(6379)]),
            ]),
            Value::Bulk(vec![
                Value::Int(8192),
                Value::Int(16383),
                Value::Bulk(vec![Value::Data(b"10.0.0.3".to_vec()), Value::Int(6379)]),
            ]),
        ]);
        let map = parse_cluster_slots(&reply).unwrap();
        assert_eq!(map.master_for_slot(0).unwrap().addr(), "10.0.0.1:6379");
        assert_eq!(map.master_for_slot(16383).unwrap().addr(), "10.0.0.3:6379");
        assert_eq!(map.master_addrs().len(), 2);
        assert_eq!(map.node_addrs().len(), 3);
    }
}
