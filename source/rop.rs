// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxcfxics - XID, PCL
// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxcdata - GLOBCNT
//
// Entry identifiers are 64 bits wide: the low 16 bits carry the replica id (1 is
// the local replica), the high 48 bits the global counter. Change numbers use the
// same layout so that property-level comparisons stay monotonic.

use crate::store::{Error, Result};
use std::{collections, time};

// Size of an eid reservation carved out of the store-wide counter for one folder.
pub const ALLOCATED_EID_RANGE: u64 = 0x10000;

const GC_MAX: u64 = (1 << 48) - 1;
// Seconds between 1601-01-01 and 1970-01-01.
const TIME_FIXUP: u64 = 11_644_473_600;

pub fn make_eid(replid: u16, gc: u64) -> u64 {
  (gc << 16) | u64::from(replid)
}

pub fn replid(eid: u64) -> u16 {
  (eid & 0xffff) as u16
}

pub fn gc_value(eid: u64) -> u64 {
  eid >> 16
}

// GLOBCNTs serialise big-endian so that lexicographic byte order matches numeric
// order.
pub fn gc_to_bytes(gc: u64) -> [u8; 6] {
  let b = gc.to_be_bytes();
  [b[2], b[3], b[4], b[5], b[6], b[7]]
}

pub fn gc_from_bytes(bytes: &[u8; 6]) -> u64 {
  let mut b = [0u8; 8];
  b[2..].copy_from_slice(bytes);
  u64::from_be_bytes(b)
}

pub fn unix_to_nttime(unix: u64) -> u64 {
  (unix + TIME_FIXUP) * 10_000_000
}

pub fn nttime_to_unix(nttime: u64) -> u64 {
  nttime / 10_000_000 - TIME_FIXUP
}

pub fn current_nttime() -> u64 {
  let unix = time::SystemTime::now()
    .duration_since(time::UNIX_EPOCH)
    .unwrap_or(time::Duration::ZERO)
    .as_secs();
  unix_to_nttime(unix)
}

// The store namespace GUIDs: a private store's namespace is derived from its
// user id, a public store's from its domain id. The constant tail is what makes
// the id recoverable.
const USER_GUID_TAIL: (u16, u16, [u8; 8]) = (0x18a5, 0x6f7f, [0xbc, 0xdc, 0xea, 0x1e, 0xd0, 0x3c, 0x56, 0x57]);
const DOMAIN_GUID_TAIL: (u16, u16, [u8; 8]) = (0x0afb, 0x7df6, [0x91, 0x92, 0x49, 0x88, 0x6a, 0xa7, 0x38, 0xce]);

pub fn make_user_guid(user_id: u32) -> uuid::Uuid {
  uuid::Uuid::from_fields(user_id, USER_GUID_TAIL.0, USER_GUID_TAIL.1, &USER_GUID_TAIL.2)
}

pub fn make_domain_guid(domain_id: u32) -> uuid::Uuid {
  uuid::Uuid::from_fields(domain_id, DOMAIN_GUID_TAIL.0, DOMAIN_GUID_TAIL.1, &DOMAIN_GUID_TAIL.2)
}

pub fn user_id_from_guid(guid: uuid::Uuid) -> Option<u32> {
  let (id, d2, d3, d4) = guid.as_fields();
  (d2 == USER_GUID_TAIL.0 && d3 == USER_GUID_TAIL.1 && *d4 == USER_GUID_TAIL.2).then_some(id)
}

pub fn domain_id_from_guid(guid: uuid::Uuid) -> Option<u32> {
  let (id, d2, d3, d4) = guid.as_fields();
  (d2 == DOMAIN_GUID_TAIL.0 && d3 == DOMAIN_GUID_TAIL.1 && *d4 == DOMAIN_GUID_TAIL.2).then_some(id)
}

// A change identifier: the store namespace GUID plus the global-counter part of a
// change number. Serialises to 22 bytes (GUID little-endian, then the GLOBCNT).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Xid {
  pub guid: uuid::Uuid,
  pub gc: u64,
}

impl Xid {
  pub fn new(guid: uuid::Uuid, cn: u64) -> Self {
    Self {
      guid,
      gc: gc_value(cn),
    }
  }

  pub fn to_bytes(&self) -> [u8; 22] {
    let mut bytes = [0u8; 22];
    bytes[..16].copy_from_slice(&self.guid.to_bytes_le());
    bytes[16..].copy_from_slice(&gc_to_bytes(self.gc));
    bytes
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    if bytes.len() != 22 {
      return Err(Error::Parse(format!("XID must be 22 bytes, got {}", bytes.len())));
    }
    let mut guid = [0u8; 16];
    guid.copy_from_slice(&bytes[..16]);
    let mut gc = [0u8; 6];
    gc.copy_from_slice(&bytes[16..]);
    Ok(Self {
      guid: uuid::Uuid::from_bytes_le(guid),
      gc: gc_from_bytes(&gc),
    })
  }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PclRelation {
  Equal,
  Subset,
  Superset,
  Conflict,
}

// A predecessor change list: at most one XID per namespace GUID, always the
// highest counter seen for that namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pcl {
  entries: Vec<Xid>,
}

impl Pcl {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn entries(&self) -> &[Xid] {
    &self.entries
  }

  pub fn get(&self, guid: uuid::Uuid) -> Option<u64> {
    self
      .entries
      .iter()
      .find(|xid| xid.guid == guid)
      .map(|xid| xid.gc)
  }

  // Replaces an existing entry only when the new counter is greater.
  pub fn append(&mut self, xid: Xid) {
    match self.entries.iter_mut().find(|entry| entry.guid == xid.guid) {
      Some(entry) => {
        if xid.gc > entry.gc {
          entry.gc = xid.gc;
        }
      }
      None => self.entries.push(xid),
    }
  }

  // Entries are emitted sorted by namespace GUID, each preceded by its size.
  pub fn serialize(&self) -> Vec<u8> {
    let mut sorted: Vec<&Xid> = self.entries.iter().collect();
    sorted.sort_by_key(|xid| xid.guid.as_bytes().to_owned());
    let mut bytes = Vec::with_capacity(sorted.len() * 23);
    for xid in sorted {
      bytes.push(22);
      bytes.extend_from_slice(&xid.to_bytes());
    }
    bytes
  }

  pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
    let mut pcl = Self::new();
    while !bytes.is_empty() {
      let size = usize::from(bytes[0]);
      if size != 22 || bytes.len() < 1 + size {
        return Err(Error::Parse("truncated PCL entry".to_string()));
      }
      pcl.append(Xid::from_bytes(&bytes[1..1 + size])?);
      bytes = &bytes[1 + size..];
    }
    Ok(pcl)
  }

  // Compares two lists namespace by namespace. A list dominates another when it
  // covers every namespace of the other with a counter at least as high.
  pub fn relation(&self, other: &Self) -> PclRelation {
    let mut guids: collections::HashSet<uuid::Uuid> = collections::HashSet::new();
    guids.extend(self.entries.iter().map(|xid| xid.guid));
    guids.extend(other.entries.iter().map(|xid| xid.guid));
    let (mut dominates, mut dominated) = (true, true);
    for guid in guids {
      match (self.get(guid), other.get(guid)) {
        (Some(a), Some(b)) => {
          if a < b {
            dominates = false;
          }
          if a > b {
            dominated = false;
          }
        }
        (Some(_), None) => dominated = false,
        (None, Some(_)) => dominates = false,
        (None, None) => unreachable!(),
      }
    }
    match (dominates, dominated) {
      (true, true) => PclRelation::Equal,
      (true, false) => PclRelation::Superset,
      (false, true) => PclRelation::Subset,
      (false, false) => PclRelation::Conflict,
    }
  }
}

// Store-side counters behind the allocate_cn/allocate_message_id RPCs. A
// concrete store persists the counters before handing an id out; a reservation
// lost to a crash is skipped, never reissued.
#[derive(Debug)]
pub struct IdAllocator {
  next_cn: u64,
  next_gc: u64,
  ranges: collections::HashMap<u64, (u64, u64)>,
}

impl IdAllocator {
  pub fn new(first_gc: u64) -> Self {
    Self {
      next_cn: 1,
      next_gc: first_gc,
      ranges: collections::HashMap::new(),
    }
  }

  pub fn allocate_cn(&mut self) -> Result<u64> {
    if self.next_cn > GC_MAX {
      return Err(Error::InvariantViolated("change-number counter exhausted".to_string()));
    }
    let cn = self.next_cn;
    self.next_cn += 1;
    Ok(make_eid(1, cn))
  }

  // Reserves [cur, cur + ALLOCATED_EID_RANGE - 1] for a folder.
  pub fn allocate_range(&mut self, folder_id: u64) -> Result<(u64, u64)> {
    if self.next_gc + ALLOCATED_EID_RANGE > GC_MAX {
      return Err(Error::InvariantViolated("eid counter exhausted".to_string()));
    }
    let range = (self.next_gc, self.next_gc + ALLOCATED_EID_RANGE - 1);
    self.next_gc += ALLOCATED_EID_RANGE;
    self.ranges.insert(folder_id, range);
    Ok(range)
  }

  pub fn allocate_message_id(&mut self, folder_id: u64) -> Result<u64> {
    let (cur, max) = match self.ranges.get(&folder_id) {
      Some(&(cur, max)) if cur <= max => (cur, max),
      _ => self.allocate_range(folder_id)?,
    };
    self.ranges.insert(folder_id, (cur + 1, max));
    Ok(make_eid(1, cur))
  }
}
