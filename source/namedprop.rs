// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxprops - named property sets
//
// A named property is identified portably by (namespace GUID, numeric or string
// name); each store maps it to a local 16-bit id at or above 0x8000. Moving a
// message between stores therefore rewrites every named tag in its tree.

use crate::propval::{MessageContent, PropTag, PropertyBag};
use crate::store::{Error, Result, Store};
use std::collections;

pub const PROPID_NOT_FOUND: u16 = 0;

pub const PSETID_APPOINTMENT: uuid::Uuid = uuid::Uuid::from_u128(0x00062002_0000_0000_c000_000000000046);
pub const PSETID_MEETING: uuid::Uuid = uuid::Uuid::from_u128(0x6ed8da90_450b_101b_98da_00aa003f1305);
pub const PSETID_COMMON: uuid::Uuid = uuid::Uuid::from_u128(0x00062008_0000_0000_c000_000000000046);

pub const PIDLID_GLOBAL_OBJECT_ID: u32 = 0x0003;
pub const PIDLID_BUSY_STATUS: u32 = 0x8205;
pub const PIDLID_RESPONSE_STATUS: u32 = 0x8218;
pub const PIDLID_RECURRING: u32 = 0x8223;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum NameKind {
  Id(u32),
  Name(String),
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PropertyName {
  pub set: uuid::Uuid,
  pub kind: NameKind,
}

impl PropertyName {
  pub fn by_id(set: uuid::Uuid, lid: u32) -> Self {
    Self {
      set,
      kind: NameKind::Id(lid),
    }
  }

  pub fn by_name(set: uuid::Uuid, name: &str) -> Self {
    Self {
      set,
      kind: NameKind::Name(name.to_string()),
    }
  }
}

fn collect_bag(bag: &PropertyBag, ids: &mut collections::BTreeSet<u16>) {
  ids.extend(bag.tags().filter(|tag| tag.is_named()).map(|tag| tag.id()));
}

// Every named id used anywhere in the message tree: top-level bag, recipient
// bags, attachment bags, embedded messages recursively.
pub(crate) fn collect_named_ids(message: &MessageContent, ids: &mut collections::BTreeSet<u16>) {
  collect_bag(&message.properties, ids);
  for recipient in &message.recipients {
    collect_bag(recipient, ids);
  }
  for attachment in &message.attachments {
    collect_bag(&attachment.properties, ids);
    if let Some(embedded) = &attachment.embedded {
      collect_named_ids(embedded, ids);
    }
  }
}

pub(crate) fn rewrite_named_ids(message: &mut MessageContent, map: &collections::HashMap<u16, u16>) {
  let mut rewrite = |tag: PropTag| match map.get(&tag.id()) {
    Some(&id) if tag.is_named() => tag.with_id(id),
    _ => tag,
  };
  message.properties.map_tags(&mut rewrite);
  for recipient in message.recipients.iter_mut() {
    recipient.map_tags(&mut rewrite);
  }
  for attachment in message.attachments.iter_mut() {
    attachment.properties.map_tags(&mut rewrite);
    if let Some(embedded) = &mut attachment.embedded {
      rewrite_named_ids(embedded, map);
    }
  }
}

// Re-homes every named tag of the message tree from the source store to the
// destination store, allocating destination ids on first sight. Either the
// whole tree is rewritten or nothing is: a single unmappable id aborts before
// any tag changes.
pub fn replace_npids(message: &mut MessageContent, store: &dyn Store, src_dir: &str, dst_dir: &str) -> Result<()> {
  let mut ids = collections::BTreeSet::new();
  collect_named_ids(message, &mut ids);
  if ids.is_empty() {
    return Ok(());
  }
  let src: Vec<u16> = ids.into_iter().collect();
  let names = store.get_named_propnames(src_dir, &src)?;
  if names.len() != src.len() {
    return Err(Error::InvariantViolated(format!(
      "asked {} propnames from {src_dir}, got {}",
      src.len(),
      names.len()
    )));
  }
  let dst = store.get_named_propids(dst_dir, true, &names)?;
  if dst.len() != names.len() {
    return Err(Error::InvariantViolated(format!(
      "asked {} propids from {dst_dir}, got {}",
      names.len(),
      dst.len()
    )));
  }
  if dst.iter().any(|&id| id == PROPID_NOT_FOUND) {
    return Err(Error::NotFound);
  }
  let map: collections::HashMap<u16, u16> = src.into_iter().zip(dst).collect();
  rewrite_named_ids(message, &map);
  Ok(())
}
