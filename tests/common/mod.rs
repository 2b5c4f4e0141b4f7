// In-memory doubles for the external collaborators: the message store RPC
// surface, the directory back end and the outbound MTA queue. The store keeps
// whole messages per mailbox directory and materialises tables lazily so that
// deletions and re-sorts show up in subsequent table calls, the way the real
// store behaves.

#![allow(dead_code)]

use sift::abtree;
use sift::namedprop::PropertyName;
use sift::propval::{
  MessageContent, PropTag, PropValue, PropertyBag, RelOp, PID_TAG_CHANGE_NUMBER, PID_TAG_MID,
  PR_CHANGE_KEY, PR_PREDECESSOR_CHANGE_LIST, PR_READ, PR_STORE_RECORD_KEY,
};
use sift::restriction::{self, Restriction};
use sift::rop::{self, IdAllocator, Pcl, Xid};
use sift::store::{
  Error, MailQueue, ResolvedStore, Result, SortOrder, Store, StoreEntryId, TableMark,
};
use sift::table::ROW_TYPE_LEAF;
use std::{cmp, collections, sync};

struct StoredMessage {
  folder_id: u64,
  associated: bool,
  content: MessageContent,
}

struct StoreState {
  server_name: String,
  public: bool,
  user_id: u32,
  domain_id: u32,
  properties: PropertyBag,
  allocator: IdAllocator,
  folders: collections::HashSet<u64>,
  messages: collections::HashMap<u64, StoredMessage>,
  rules: collections::HashMap<u64, Vec<PropertyBag>>,
  named: Vec<PropertyName>,
  permissions: collections::HashMap<(u64, String), u32>,
  contacts: collections::HashSet<String>,
  busy: Vec<(u64, u64)>,
  notifications: Vec<(u64, u64)>,
}

impl StoreState {
  fn guid(&self) -> uuid::Uuid {
    if self.public {
      rop::make_domain_guid(self.domain_id)
    } else {
      rop::make_user_guid(self.user_id)
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TableSource {
  Content { folder_id: u64, associated: bool },
  Rule { folder_id: u64 },
  Empty,
}

struct TableState {
  dir: String,
  source: TableSource,
  restriction: Option<Restriction>,
  sorts: Vec<SortOrder>,
}

#[derive(Clone)]
struct Row {
  inst_id: u64,
  inst_num: u32,
  row_type: u32,
  bag: PropertyBag,
}

struct Inner {
  stores: collections::HashMap<String, StoreState>,
  next_table_id: u32,
  tables: collections::HashMap<u32, TableState>,
  next_state_id: u32,
  states: collections::HashMap<u32, (u32, u64, u32)>,
}

pub struct MemStore {
  inner: sync::Mutex<Inner>,
}

fn value_ordering(a: Option<&PropValue>, b: Option<&PropValue>) -> cmp::Ordering {
  match (a, b) {
    (Some(a), Some(b)) => {
      if a.compare(RelOp::Lt, b) {
        cmp::Ordering::Less
      } else if a.compare(RelOp::Gt, b) {
        cmp::Ordering::Greater
      } else {
        cmp::Ordering::Equal
      }
    }
    (None, Some(_)) => cmp::Ordering::Less,
    (Some(_), None) => cmp::Ordering::Greater,
    (None, None) => cmp::Ordering::Equal,
  }
}

fn materialize(inner: &Inner, table_id: u32) -> Result<Vec<Row>> {
  let table = inner.tables.get(&table_id).ok_or(Error::NotFound)?;
  let state = inner.stores.get(&table.dir).ok_or(Error::NotFound)?;
  let mut rows: Vec<Row> = match table.source {
    TableSource::Content { folder_id, associated } => state
      .messages
      .iter()
      .filter(|(_, message)| message.folder_id == folder_id && message.associated == associated)
      .filter(|(_, message)| match &table.restriction {
        Some(restriction) => restriction::eval_message(restriction, &message.content),
        None => true,
      })
      .map(|(&message_id, message)| Row {
        inst_id: message_id,
        inst_num: 0,
        row_type: ROW_TYPE_LEAF,
        bag: message.content.properties.clone(),
      })
      .collect(),
    TableSource::Rule { folder_id } => state
      .rules
      .get(&folder_id)
      .map(|rules| rules.as_slice())
      .unwrap_or(&[])
      .iter()
      .enumerate()
      .filter(|(_, row)| match &table.restriction {
        Some(restriction) => restriction::eval_bag(restriction, row),
        None => true,
      })
      .map(|(index, row)| Row {
        inst_id: index as u64,
        inst_num: 0,
        row_type: ROW_TYPE_LEAF,
        bag: (*row).clone(),
      })
      .collect(),
    TableSource::Empty => Vec::new(),
  };
  rows.sort_by(|x, y| {
    for sort in &table.sorts {
      let mut ordering = value_ordering(x.bag.get(sort.tag), y.bag.get(sort.tag));
      if sort.descending {
        ordering = ordering.reverse();
      }
      if ordering != cmp::Ordering::Equal {
        return ordering;
      }
    }
    x.inst_id.cmp(&y.inst_id)
  });
  Ok(rows)
}

impl MemStore {
  pub fn new() -> Self {
    Self {
      inner: sync::Mutex::new(Inner {
        stores: collections::HashMap::new(),
        next_table_id: 1,
        tables: collections::HashMap::new(),
        next_state_id: 1,
        states: collections::HashMap::new(),
      }),
    }
  }

  pub fn add_store(&self, dir: &str, server_name: &str, public: bool, user_id: u32, domain_id: u32) {
    let mut state = StoreState {
      server_name: server_name.to_string(),
      public,
      user_id,
      domain_id,
      properties: PropertyBag::new(),
      allocator: IdAllocator::new(0x1000),
      folders: collections::HashSet::new(),
      messages: collections::HashMap::new(),
      rules: collections::HashMap::new(),
      named: Vec::new(),
      permissions: collections::HashMap::new(),
      contacts: collections::HashSet::new(),
      busy: Vec::new(),
      notifications: Vec::new(),
    };
    let guid = state.guid();
    state
      .properties
      .set(PR_STORE_RECORD_KEY, PropValue::Binary(guid.to_bytes_le().to_vec()));
    self.inner.lock().unwrap().stores.insert(dir.to_string(), state);
  }

  fn with_store<R>(&self, dir: &str, f: impl FnOnce(&mut StoreState) -> R) -> Result<R> {
    let mut inner = self.inner.lock().unwrap();
    inner.stores.get_mut(dir).map(f).ok_or(Error::NotFound)
  }

  pub fn add_folder(&self, dir: &str, folder_id: u64) {
    self
      .with_store(dir, |state| {
        state.folders.insert(folder_id);
      })
      .unwrap();
  }

  pub fn set_store_property(&self, dir: &str, tag: PropTag, value: PropValue) {
    self
      .with_store(dir, |state| state.properties.set(tag, value))
      .unwrap();
  }

  pub fn set_permission(&self, dir: &str, folder_id: u64, username: &str, bits: u32) {
    self
      .with_store(dir, |state| {
        state.permissions.insert((folder_id, username.to_string()), bits);
      })
      .unwrap();
  }

  pub fn add_contact(&self, dir: &str, address: &str) {
    self
      .with_store(dir, |state| {
        state.contacts.insert(address.to_ascii_lowercase());
      })
      .unwrap();
  }

  pub fn add_busy(&self, dir: &str, start: u64, end: u64) {
    self
      .with_store(dir, |state| state.busy.push((start, end)))
      .unwrap();
  }

  pub fn add_rule(&self, dir: &str, folder_id: u64, row: PropertyBag) {
    self
      .with_store(dir, |state| {
        state.rules.entry(folder_id).or_default().push(row);
      })
      .unwrap();
  }

  fn store_message(&self, dir: &str, folder_id: u64, mut content: MessageContent, associated: bool) -> u64 {
    self
      .with_store(dir, |state| {
        let message_id = state.allocator.allocate_message_id(folder_id).unwrap();
        let cn = state.allocator.allocate_cn().unwrap();
        let xid = Xid::new(state.guid(), cn);
        let mut pcl = Pcl::new();
        pcl.append(xid);
        content.properties.set(PID_TAG_MID, PropValue::LongLong(message_id as i64));
        content
          .properties
          .set(PID_TAG_CHANGE_NUMBER, PropValue::LongLong(cn as i64));
        content
          .properties
          .set(PR_CHANGE_KEY, PropValue::Binary(xid.to_bytes().to_vec()));
        content
          .properties
          .set(PR_PREDECESSOR_CHANGE_LIST, PropValue::Binary(pcl.serialize()));
        state.messages.insert(
          message_id,
          StoredMessage {
            folder_id,
            associated,
            content,
          },
        );
        message_id
      })
      .unwrap()
  }

  // Files a freshly arrived message the way the MDA would, before any rules.
  pub fn deliver(&self, dir: &str, folder_id: u64, content: MessageContent) -> u64 {
    self.store_message(dir, folder_id, content, false)
  }

  pub fn add_associated(&self, dir: &str, folder_id: u64, content: MessageContent) -> u64 {
    self.store_message(dir, folder_id, content, true)
  }

  pub fn message(&self, dir: &str, message_id: u64) -> Option<MessageContent> {
    let inner = self.inner.lock().unwrap();
    inner
      .stores
      .get(dir)?
      .messages
      .get(&message_id)
      .map(|message| message.content.clone())
  }

  pub fn folder_messages(&self, dir: &str, folder_id: u64) -> Vec<u64> {
    let inner = self.inner.lock().unwrap();
    let mut ids: Vec<u64> = inner
      .stores
      .get(dir)
      .map(|state| {
        state
          .messages
          .iter()
          .filter(|(_, message)| message.folder_id == folder_id && !message.associated)
          .map(|(&message_id, _)| message_id)
          .collect()
      })
      .unwrap_or_default();
    ids.sort();
    ids
  }

  pub fn notifications(&self, dir: &str) -> Vec<(u64, u64)> {
    let inner = self.inner.lock().unwrap();
    inner
      .stores
      .get(dir)
      .map(|state| state.notifications.clone())
      .unwrap_or_default()
  }

  pub fn message_cn(&self, dir: &str, message_id: u64) -> Option<u64> {
    self
      .message(dir, message_id)?
      .properties
      .get_longlong(PID_TAG_CHANGE_NUMBER)
      .map(|cn| cn as u64)
  }

  fn load_table(&self, dir: &str, source: TableSource, restriction: Option<&Restriction>, sorts: &[SortOrder]) -> Result<(u32, u32)> {
    let mut inner = self.inner.lock().unwrap();
    if !inner.stores.contains_key(dir) {
      return Err(Error::NotFound);
    }
    let table_id = inner.next_table_id;
    inner.next_table_id += 1;
    inner.tables.insert(
      table_id,
      TableState {
        dir: dir.to_string(),
        source,
        restriction: restriction.cloned(),
        sorts: sorts.to_vec(),
      },
    );
    let count = materialize(&inner, table_id)?.len() as u32;
    Ok((table_id, count))
  }
}

impl Store for MemStore {
  fn get_store_properties(&self, dir: &str, tags: &[PropTag]) -> Result<PropertyBag> {
    self.with_store(dir, |state| {
      tags
        .iter()
        .filter_map(|&tag| state.properties.get(tag).map(|value| (tag, value.clone())))
        .collect()
    })
  }

  fn get_folder_perm(&self, dir: &str, folder_id: u64, username: &str) -> Result<u32> {
    self.with_store(dir, |state| {
      state
        .permissions
        .get(&(folder_id, username.to_string()))
        .copied()
        .unwrap_or(0)
    })
  }

  fn load_rule_table(&self, dir: &str, folder_id: u64, restriction: Option<&Restriction>) -> Result<(u32, u32)> {
    self.load_table(dir, TableSource::Rule { folder_id }, restriction, &[])
  }

  fn load_content_table(
    &self,
    dir: &str,
    folder_id: u64,
    flags: u32,
    restriction: Option<&Restriction>,
    sorts: &[SortOrder],
  ) -> Result<(u32, u32)> {
    let associated = flags & sift::store::TABLE_FLAG_ASSOCIATED != 0;
    self.load_table(dir, TableSource::Content { folder_id, associated }, restriction, sorts)
  }

  fn load_hierarchy_table(&self, dir: &str, _folder_id: u64, _flags: u32, restriction: Option<&Restriction>) -> Result<(u32, u32)> {
    self.load_table(dir, TableSource::Empty, restriction, &[])
  }

  fn load_permission_table(&self, dir: &str, _folder_id: u64, _flags: u32) -> Result<(u32, u32)> {
    self.load_table(dir, TableSource::Empty, None, &[])
  }

  fn sum_table(&self, _dir: &str, table_id: u32) -> Result<u32> {
    let inner = self.inner.lock().unwrap();
    Ok(materialize(&inner, table_id)?.len() as u32)
  }

  fn query_table(&self, _dir: &str, table_id: u32, columns: &[PropTag], start: u32, count: u32) -> Result<Vec<PropertyBag>> {
    let inner = self.inner.lock().unwrap();
    let rows = materialize(&inner, table_id)?;
    Ok(
      rows
        .iter()
        .skip(start as usize)
        .take(count as usize)
        .map(|row| {
          columns
            .iter()
            .filter_map(|&tag| row.bag.get(tag).map(|value| (tag, value.clone())))
            .collect()
        })
        .collect(),
    )
  }

  fn mark_table(&self, _dir: &str, table_id: u32, position: u32) -> Result<TableMark> {
    let inner = self.inner.lock().unwrap();
    let rows = materialize(&inner, table_id)?;
    let row = rows.get(position as usize).ok_or(Error::NotFound)?;
    Ok(TableMark {
      inst_id: row.inst_id,
      inst_num: row.inst_num,
      row_type: row.row_type,
    })
  }

  fn locate_table(&self, _dir: &str, table_id: u32, inst_id: u64, inst_num: u32) -> Result<Option<(u32, u32)>> {
    let inner = self.inner.lock().unwrap();
    let rows = materialize(&inner, table_id)?;
    Ok(
      rows
        .iter()
        .position(|row| row.inst_id == inst_id && row.inst_num == inst_num)
        .map(|position| (position as u32, rows[position].row_type)),
    )
  }

  fn expand_table(&self, _dir: &str, _table_id: u32, _inst_id: u64) -> Result<Option<(u32, u32)>> {
    Ok(None)
  }

  fn collapse_table(&self, _dir: &str, _table_id: u32, _inst_id: u64) -> Result<Option<(u32, u32)>> {
    Ok(None)
  }

  fn store_table_state(&self, _dir: &str, table_id: u32, inst_id: u64, inst_num: u32) -> Result<u32> {
    let mut inner = self.inner.lock().unwrap();
    let state_id = inner.next_state_id;
    inner.next_state_id += 1;
    inner.states.insert(state_id, (table_id, inst_id, inst_num));
    Ok(state_id)
  }

  fn restore_table_state(&self, _dir: &str, table_id: u32, state_id: u32) -> Result<Option<u32>> {
    let inner = self.inner.lock().unwrap();
    let &(saved_table, inst_id, inst_num) = inner.states.get(&state_id).ok_or(Error::NotFound)?;
    if saved_table != table_id {
      return Err(Error::NotFound);
    }
    let rows = materialize(&inner, table_id)?;
    Ok(
      rows
        .iter()
        .position(|row| row.inst_id == inst_id && row.inst_num == inst_num)
        .map(|position| position as u32),
    )
  }

  fn unload_table(&self, _dir: &str, table_id: u32) -> Result<()> {
    self.inner.lock().unwrap().tables.remove(&table_id);
    Ok(())
  }

  fn get_message_properties(&self, dir: &str, message_id: u64, tags: &[PropTag]) -> Result<PropertyBag> {
    self.with_store(dir, |state| {
      state
        .messages
        .get(&message_id)
        .map(|message| {
          tags
            .iter()
            .filter_map(|&tag| message.content.properties.get(tag).map(|value| (tag, value.clone())))
            .collect()
        })
        .ok_or(Error::NotFound)
    })?
  }

  fn read_message(&self, dir: &str, message_id: u64) -> Result<MessageContent> {
    self.with_store(dir, |state| {
      state
        .messages
        .get(&message_id)
        .map(|message| message.content.clone())
        .ok_or(Error::NotFound)
    })?
  }

  fn write_message(&self, dir: &str, folder_id: u64, message: &MessageContent) -> Result<()> {
    self.with_store(dir, |state| {
      if !state.folders.contains(&folder_id) {
        return Err(Error::NotFound);
      }
      let message_id = message
        .properties
        .get_longlong(PID_TAG_MID)
        .ok_or_else(|| Error::InvariantViolated("write_message without a mid".to_string()))? as u64;
      state.messages.insert(
        message_id,
        StoredMessage {
          folder_id,
          associated: false,
          content: message.clone(),
        },
      );
      Ok(())
    })?
  }

  fn delete_messages(&self, dir: &str, folder_id: u64, message_ids: &[u64], _hard: bool) -> Result<()> {
    self.with_store(dir, |state| {
      for message_id in message_ids {
        match state.messages.get(message_id) {
          Some(message) if message.folder_id == folder_id => {
            state.messages.remove(message_id);
          }
          _ => (),
        }
      }
    })
  }

  fn set_message_properties(&self, dir: &str, message_id: u64, properties: &PropertyBag) -> Result<()> {
    self.with_store(dir, |state| {
      let message = state.messages.get_mut(&message_id).ok_or(Error::NotFound)?;
      for (tag, value) in properties.iter() {
        message.content.properties.set(tag, value.clone());
      }
      Ok(())
    })?
  }

  fn set_message_read_state(&self, dir: &str, message_id: u64, read: bool) -> Result<u64> {
    self.with_store(dir, |state| {
      let cn = state.allocator.allocate_cn()?;
      let message = state.messages.get_mut(&message_id).ok_or(Error::NotFound)?;
      message.content.properties.set(PR_READ, PropValue::Bool(read));
      Ok(cn)
    })?
  }

  fn allocate_cn(&self, dir: &str) -> Result<u64> {
    self.with_store(dir, |state| state.allocator.allocate_cn())?
  }

  fn allocate_message_id(&self, dir: &str, folder_id: u64) -> Result<u64> {
    self.with_store(dir, |state| state.allocator.allocate_message_id(folder_id))?
  }

  fn movecopy_message(&self, dir: &str, message_id: u64, folder_id: u64, new_message_id: u64, del: bool) -> Result<()> {
    self.with_store(dir, |state| {
      if !state.folders.contains(&folder_id) {
        return Err(Error::NotFound);
      }
      let mut content = state
        .messages
        .get(&message_id)
        .ok_or(Error::NotFound)?
        .content
        .clone();
      // The store stamps the destination with a fresh change number.
      let cn = state.allocator.allocate_cn()?;
      let xid = Xid::new(state.guid(), cn);
      let mut pcl = match content.properties.get_bytes(PR_PREDECESSOR_CHANGE_LIST) {
        Some(bytes) => Pcl::from_bytes(bytes)?,
        None => Pcl::new(),
      };
      pcl.append(xid);
      content.properties.set(PID_TAG_MID, PropValue::LongLong(new_message_id as i64));
      content.properties.set(PID_TAG_CHANGE_NUMBER, PropValue::LongLong(cn as i64));
      content
        .properties
        .set(PR_CHANGE_KEY, PropValue::Binary(xid.to_bytes().to_vec()));
      content
        .properties
        .set(PR_PREDECESSOR_CHANGE_LIST, PropValue::Binary(pcl.serialize()));
      if del {
        state.messages.remove(&message_id);
      }
      state.messages.insert(
        new_message_id,
        StoredMessage {
          folder_id,
          associated: false,
          content,
        },
      );
      Ok(())
    })?
  }

  fn get_named_propids(&self, dir: &str, create: bool, names: &[PropertyName]) -> Result<Vec<u16>> {
    self.with_store(dir, |state| {
      names
        .iter()
        .map(|name| match state.named.iter().position(|known| known == name) {
          Some(index) => 0x8000 + index as u16,
          None if create => {
            state.named.push(name.clone());
            0x8000 + (state.named.len() - 1) as u16
          }
          None => 0,
        })
        .collect()
    })
  }

  fn get_named_propnames(&self, dir: &str, ids: &[u16]) -> Result<Vec<PropertyName>> {
    self.with_store(dir, |state| {
      ids
        .iter()
        .map(|&id| {
          state
            .named
            .get(id.checked_sub(0x8000).ok_or(Error::NotFound)? as usize)
            .cloned()
            .ok_or(Error::NotFound)
        })
        .collect()
    })?
  }

  fn notify_new_mail(&self, dir: &str, folder_id: u64, message_id: u64) -> Result<()> {
    self.with_store(dir, |state| state.notifications.push((folder_id, message_id)))
  }

  fn appt_meetreq_overlap(&self, dir: &str, start: u64, end: u64) -> Result<u32> {
    self.with_store(dir, |state| {
      state
        .busy
        .iter()
        .filter(|&&(busy_start, busy_end)| busy_start < end && start < busy_end)
        .count() as u32
    })
  }

  fn store_eid_to_user(&self, _dir: &str, store_eid: &StoreEntryId) -> Result<ResolvedStore> {
    let inner = self.inner.lock().unwrap();
    inner
      .stores
      .iter()
      .find(|(_, state)| state.server_name == store_eid.server_name && state.public == store_eid.public)
      .map(|(dir, state)| ResolvedStore {
        dir: dir.clone(),
        user_id: state.user_id,
        domain_id: state.domain_id,
      })
      .ok_or(Error::NotFound)
  }

  fn check_contact_address(&self, dir: &str, address: &str) -> Result<bool> {
    self.with_store(dir, |state| state.contacts.contains(&address.to_ascii_lowercase()))
  }
}

#[derive(Default)]
pub struct MemQueue {
  pub mails: sync::Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl MailQueue for MemQueue {
  fn enqueue(&self, envelope_from: &str, envelope_to: &str, content: &[u8]) -> Result<()> {
    self.mails.lock().unwrap().push((
      envelope_from.to_string(),
      envelope_to.to_string(),
      content.to_vec(),
    ));
    Ok(())
  }
}

// A directory that only knows which domains are local and that all local
// domains belong to one organisation; the tree queries stay unused here.
pub struct FlatDirectory {
  pub domains: Vec<String>,
}

impl abtree::Directory for FlatDirectory {
  fn org_domains(&self, _org_id: u32) -> Result<Vec<u32>> {
    Ok(Vec::new())
  }

  fn domain_info(&self, domain_id: u32) -> Result<abtree::DomainInfo> {
    Ok(abtree::DomainInfo {
      id: domain_id,
      ..abtree::DomainInfo::default()
    })
  }

  fn domain_groups(&self, _domain_id: u32) -> Result<Vec<abtree::GroupInfo>> {
    Ok(Vec::new())
  }

  fn group_classes(&self, _group_id: u32) -> Result<Vec<abtree::ClassInfo>> {
    Ok(Vec::new())
  }

  fn sub_classes(&self, _class_id: u32) -> Result<Vec<abtree::ClassInfo>> {
    Ok(Vec::new())
  }

  fn class_users(&self, _class_id: u32) -> Result<Vec<abtree::UserInfo>> {
    Ok(Vec::new())
  }

  fn group_users(&self, _group_id: u32) -> Result<Vec<abtree::UserInfo>> {
    Ok(Vec::new())
  }

  fn domain_users(&self, _domain_id: u32) -> Result<Vec<abtree::UserInfo>> {
    Ok(Vec::new())
  }

  fn check_domain(&self, domain: &str) -> bool {
    self.domains.iter().any(|known| known.eq_ignore_ascii_case(domain))
  }

  fn check_same_org(&self, a: &str, b: &str) -> bool {
    self.check_domain(a) && self.check_domain(b)
  }
}

pub fn rule_row(rule_id: u64, seq: i32, state: u32, condition: Option<Restriction>, actions: Vec<sift::rules::ActionBlock>) -> PropertyBag {
  let mut row = PropertyBag::new();
  row.set(sift::propval::PR_RULE_ID, PropValue::LongLong(rule_id as i64));
  row.set(sift::propval::PR_RULE_SEQUENCE, PropValue::Long(seq));
  row.set(sift::propval::PR_RULE_STATE, PropValue::Long(state as i32));
  row.set(
    sift::propval::PR_RULE_NAME,
    PropValue::Unicode(format!("rule-{rule_id}")),
  );
  row.set(
    sift::propval::PR_RULE_PROVIDER,
    PropValue::Unicode("RuleOrganizer".to_string()),
  );
  if let Some(condition) = condition {
    row.set(
      sift::propval::PR_RULE_CONDITION,
      PropValue::Restriction(Box::new(condition)),
    );
  }
  row.set(sift::propval::PR_RULE_ACTIONS, PropValue::RuleActions(actions));
  row
}
