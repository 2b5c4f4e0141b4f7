// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxnspi - address book semantics
//
// One base is the address-book forest for either a whole organisation (positive
// id, one tree per domain) or a single domain (negative id). Nodes live in a
// flat arena per base; parents and children are arena indices, never pointers.
// Cross-base references are (base id, minid) stubs resolved on demand and kept
// on a per-base remote list.

use crate::propval::{self, PropTag, PropValue, DT_DISTLIST, DT_EQUIPMENT, DT_ROOM};
use crate::store::{Error, Result};
use std::sync::{self, atomic};
use std::{cmp, collections, thread, time};

const BASE_STATUS_CONSTRUCTING: u8 = 0;
const BASE_STATUS_LIVING: u8 = 1;

const MINID_TYPE_ADDRESS: u32 = 0x0;
const MINID_TYPE_DOMAIN: u32 = 0x4;
const MINID_TYPE_GROUP: u32 = 0x5;
const MINID_TYPE_CLASS: u32 = 0x6;
// Minids 0x00..=0x10 are reserved by the NSPI front end.
const MINID_TYPE_RESERVED: u32 = 0x7;

pub const MLIST_TYPE_NORMAL: u32 = 0;
pub const MLIST_TYPE_GROUP: u32 = 1;
pub const MLIST_TYPE_DOMAIN: u32 = 2;
pub const MLIST_TYPE_CLASS: u32 = 3;

pub fn make_minid(mut kind: u32, value: u32) -> u32 {
  if kind == MINID_TYPE_ADDRESS && value <= 0x10 {
    kind = MINID_TYPE_RESERVED;
  }
  kind << 29 | (value & 0x1fff_ffff)
}

pub fn minid_value(minid: u32) -> u32 {
  if minid & 0x8000_0000 == 0 {
    minid
  } else {
    minid & 0x1fff_ffff
  }
}

pub fn address_minid(id: u32) -> u32 {
  make_minid(MINID_TYPE_ADDRESS, id)
}

#[derive(Clone, Debug, Default)]
pub struct DomainInfo {
  pub id: u32,
  pub name: String,
  pub title: String,
  pub address: String,
}

#[derive(Clone, Debug, Default)]
pub struct GroupInfo {
  pub id: u32,
  pub name: String,
  pub title: String,
}

#[derive(Clone, Debug, Default)]
pub struct ClassInfo {
  pub id: u32,
  pub name: String,
}

#[derive(Clone, Debug, Default)]
pub struct UserInfo {
  pub id: u32,
  pub username: String,
  pub display_type: i32,
  pub maildir: String,
  pub list_type: u32,
  pub list_privilege: u32,
  pub properties: collections::HashMap<PropTag, String>,
  pub aliases: Vec<String>,
}

// The directory back end the forest is composed from.
pub trait Directory {
  fn org_domains(&self, org_id: u32) -> Result<Vec<u32>>;
  fn domain_info(&self, domain_id: u32) -> Result<DomainInfo>;
  fn domain_groups(&self, domain_id: u32) -> Result<Vec<GroupInfo>>;
  fn group_classes(&self, group_id: u32) -> Result<Vec<ClassInfo>>;
  fn sub_classes(&self, class_id: u32) -> Result<Vec<ClassInfo>>;
  fn class_users(&self, class_id: u32) -> Result<Vec<UserInfo>>;
  fn group_users(&self, group_id: u32) -> Result<Vec<UserInfo>>;
  // Users directly under the domain, outside any group.
  fn domain_users(&self, domain_id: u32) -> Result<Vec<UserInfo>>;
  fn check_domain(&self, domain: &str) -> bool;
  fn check_same_org(&self, a: &str, b: &str) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
  Person,
  Room,
  Equipment,
  Mlist,
  Remote,
  Domain,
  Group,
  Class,
}

impl NodeType {
  // Container codes keep the high bit, leaves stay below 0x80; the code feeds
  // both the GUID derivation and the path letters.
  fn code(self) -> u8 {
    match self {
      Self::Person => 0x00,
      Self::Room => 0x01,
      Self::Equipment => 0x02,
      Self::Mlist => 0x03,
      Self::Remote => 0x04,
      Self::Domain => 0x81,
      Self::Group => 0x82,
      Self::Class => 0x83,
    }
  }

  fn letter(self) -> char {
    match self {
      Self::Person => 'p',
      Self::Room => 'r',
      Self::Equipment => 'e',
      Self::Mlist => 'l',
      Self::Remote => 'x',
      Self::Domain => 'd',
      Self::Group => 'g',
      Self::Class => 'c',
    }
  }

  pub fn is_container(self) -> bool {
    self.code() >= 0x80
  }
}

#[derive(Clone, Debug)]
pub enum NodeData {
  Domain(DomainInfo),
  Group(GroupInfo),
  Class(ClassInfo),
  // Person, room, equipment and distribution lists all carry directory users;
  // the display type discriminates.
  User(UserInfo),
}

#[derive(Clone, Debug)]
struct Node {
  minid: u32,
  id: u32,
  parent: Option<usize>,
  children: Vec<usize>,
  // Same minid already cached under another container; aliases never join the
  // GAL and delegate their GUID to the canonical node.
  alias: bool,
  data: NodeData,
}

impl Node {
  fn node_type(&self) -> NodeType {
    match &self.data {
      NodeData::Domain(_) => NodeType::Domain,
      NodeData::Group(_) => NodeType::Group,
      NodeData::Class(_) => NodeType::Class,
      NodeData::User(user) => match user.display_type {
        DT_ROOM => NodeType::Room,
        DT_EQUIPMENT => NodeType::Equipment,
        DT_DISTLIST => NodeType::Mlist,
        _ => NodeType::Person,
      },
    }
  }

  fn display_name(&self) -> String {
    match &self.data {
      NodeData::Domain(domain) => domain.title.clone(),
      NodeData::Group(group) => group.title.clone(),
      NodeData::Class(class) => class.name.clone(),
      NodeData::User(user) => user_display_name(user),
    }
  }
}

fn user_display_name(user: &UserInfo) -> String {
  let display = user.properties.get(&propval::PR_DISPLAY_NAME);
  if user.display_type == DT_DISTLIST {
    let display = display.map(String::as_str).unwrap_or("");
    return match user.list_type {
      MLIST_TYPE_GROUP => format!("all users in department of {display}"),
      MLIST_TYPE_DOMAIN => "all users in domain".to_string(),
      MLIST_TYPE_CLASS => format!("all users in group of {display}"),
      MLIST_TYPE_NORMAL => format!("{}(custom address list)", user.username),
      other => format!("unknown address list type {other}"),
    };
  }
  match display {
    Some(display) => display.clone(),
    // Fall back to the localpart of the mail address.
    None => user.username.split('@').next().unwrap_or("").to_string(),
  }
}

#[derive(Clone, Debug)]
struct RemoteStub {
  minid: u32,
  domain_id: u32,
  data: NodeData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeHandle {
  Local(usize),
  Remote(usize),
}

pub struct Base {
  pub base_id: i32,
  pub guid: uuid::Uuid,
  org_name: String,
  nodes: Vec<Node>,
  roots: Vec<usize>,
  index: collections::HashMap<u32, usize>,
  gal: Vec<usize>,
  remotes: sync::Mutex<Vec<RemoteStub>>,
}

fn fold(s: &str) -> String {
  s.to_ascii_lowercase()
}

impl Base {
  fn load(base_id: i32, org_name: &str, directory: &dyn Directory) -> Result<Self> {
    let mut base = Self {
      base_id,
      guid: base_guid(base_id),
      org_name: org_name.to_string(),
      nodes: Vec::new(),
      roots: Vec::new(),
      index: collections::HashMap::new(),
      gal: Vec::new(),
      remotes: sync::Mutex::new(Vec::new()),
    };
    let domains = if base_id > 0 {
      directory.org_domains(base_id as u32)?
    } else {
      vec![(-base_id) as u32]
    };
    for domain_id in domains {
      let root = base.load_domain(domain_id, directory)?;
      base.roots.push(root);
    }
    base.build_gal();
    Ok(base)
  }

  fn insert(&mut self, minid: u32, id: u32, parent: Option<usize>, data: NodeData) -> usize {
    let index = self.nodes.len();
    let alias = self.index.contains_key(&minid);
    self.nodes.push(Node {
      minid,
      id,
      parent,
      children: Vec::new(),
      alias,
      data,
    });
    if !alias {
      self.index.insert(minid, index);
    }
    if let Some(parent) = parent {
      self.nodes[parent].children.push(index);
    }
    index
  }

  fn insert_users(&mut self, parent: usize, users: Vec<UserInfo>) {
    // Users and lists appear under their container sorted by display name.
    let mut keyed: Vec<(String, UserInfo)> = users
      .into_iter()
      .map(|user| (fold(&user_display_name(&user)), user))
      .collect();
    keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (_, user) in keyed {
      self.insert(address_minid(user.id), user.id, Some(parent), NodeData::User(user));
    }
  }

  fn load_class(&mut self, class_id: u32, parent: usize, directory: &dyn Directory) -> Result<()> {
    for class in directory.sub_classes(class_id)? {
      let child = self.insert(
        make_minid(MINID_TYPE_CLASS, class.id),
        class.id,
        Some(parent),
        NodeData::Class(class.clone()),
      );
      self.load_class(class.id, child, directory)?;
    }
    let users = directory.class_users(class_id)?;
    self.insert_users(parent, users);
    Ok(())
  }

  fn load_domain(&mut self, domain_id: u32, directory: &dyn Directory) -> Result<usize> {
    let info = directory.domain_info(domain_id)?;
    let root = self.insert(
      make_minid(MINID_TYPE_DOMAIN, domain_id),
      domain_id,
      None,
      NodeData::Domain(info),
    );
    for group in directory.domain_groups(domain_id)? {
      let group_node = self.insert(
        make_minid(MINID_TYPE_GROUP, group.id),
        group.id,
        Some(root),
        NodeData::Group(group.clone()),
      );
      for class in directory.group_classes(group.id)? {
        let class_node = self.insert(
          make_minid(MINID_TYPE_CLASS, class.id),
          class.id,
          Some(group_node),
          NodeData::Class(class.clone()),
        );
        self.load_class(class.id, class_node, directory)?;
      }
      let users = directory.group_users(group.id)?;
      self.insert_users(group_node, users);
    }
    let users = directory.domain_users(domain_id)?;
    self.insert_users(root, users);
    Ok(root)
  }

  // The GAL is the flat concatenation of every visible leaf, sorted by folded
  // display name. Aliases and remote stubs stay out.
  fn build_gal(&mut self) {
    let mut entries: Vec<(String, usize)> = self
      .nodes
      .iter()
      .enumerate()
      .filter(|(_, node)| !node.node_type().is_container() && !node.alias)
      .map(|(index, node)| (fold(&node.display_name()), index))
      .collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    self.gal = entries.into_iter().map(|(_, index)| index).collect();
  }

  fn with_node<R>(&self, handle: NodeHandle, f: impl FnOnce(&Node) -> R) -> Option<R> {
    match handle {
      NodeHandle::Local(index) => self.nodes.get(index).map(f),
      NodeHandle::Remote(index) => {
        let remotes = self.remotes.lock().unwrap();
        remotes.get(index).map(|stub| {
          f(&Node {
            minid: stub.minid,
            id: stub.domain_id,
            parent: None,
            children: Vec::new(),
            alias: false,
            data: stub.data.clone(),
          })
        })
      }
    }
  }

  pub fn minid_to_node(&self, minid: u32) -> Option<NodeHandle> {
    if let Some(&index) = self.index.get(&minid) {
      return Some(NodeHandle::Local(index));
    }
    let remotes = self.remotes.lock().unwrap();
    remotes
      .iter()
      .position(|stub| stub.minid == minid)
      .map(NodeHandle::Remote)
  }

  pub fn uid_to_node(&self, user_id: u32) -> Option<NodeHandle> {
    self
      .index
      .get(&address_minid(user_id))
      .map(|&index| NodeHandle::Local(index))
  }

  pub fn gal(&self) -> Vec<NodeHandle> {
    self.gal.iter().map(|&index| NodeHandle::Local(index)).collect()
  }

  pub fn node_type(&self, handle: NodeHandle) -> Option<NodeType> {
    match handle {
      NodeHandle::Local(_) => self.with_node(handle, Node::node_type),
      NodeHandle::Remote(_) => Some(NodeType::Remote),
    }
  }

  pub fn node_minid(&self, handle: NodeHandle) -> Option<u32> {
    self.with_node(handle, |node| node.minid)
  }

  pub fn display_name(&self, handle: NodeHandle) -> Option<String> {
    self.with_node(handle, Node::display_name)
  }

  pub fn user_info(&self, handle: NodeHandle) -> Option<UserInfo> {
    self.with_node(handle, |node| match &node.data {
      NodeData::User(user) => Some(user.clone()),
      _ => None,
    })?
  }

  pub fn mlist_info(&self, handle: NodeHandle) -> Option<(String, u32)> {
    self.with_node(handle, |node| match &node.data {
      NodeData::User(user) if user.display_type == DT_DISTLIST => {
        Some((user.username.clone(), user.list_privilege))
      }
      _ => None,
    })?
  }

  // Title and address of the domain at the root of the node's tree.
  pub fn company_info(&self, handle: NodeHandle) -> Option<(String, String)> {
    let mut index = match handle {
      NodeHandle::Local(index) => index,
      NodeHandle::Remote(_) => return None,
    };
    while let Some(parent) = self.nodes.get(index)?.parent {
      index = parent;
    }
    match &self.nodes.get(index)?.data {
      NodeData::Domain(domain) => Some((domain.title.clone(), domain.address.clone())),
      _ => None,
    }
  }

  // Title of the nearest enclosing group.
  pub fn department_name(&self, handle: NodeHandle) -> Option<String> {
    let mut index = match handle {
      NodeHandle::Local(index) => index,
      NodeHandle::Remote(_) => return None,
    };
    loop {
      if let NodeData::Group(group) = &self.nodes.get(index)?.data {
        return Some(group.title.clone());
      }
      index = self.nodes.get(index)?.parent?;
    }
  }

  fn path(&self, mut index: usize) -> String {
    let mut segments = Vec::new();
    loop {
      let node = &self.nodes[index];
      segments.push(format!("{}{}", node.node_type().letter(), node.id));
      match node.parent {
        Some(parent) => index = parent,
        None => break,
      }
    }
    segments.reverse();
    segments.join("/")
  }

  // Deterministic GUID: time_low packs (type | root id), time_mid/hi pack the
  // node id, the node and clock_seq fields pack the first 8 even-indexed bytes
  // of the MD5 of the root-to-node path.
  pub fn node_to_guid(&self, handle: NodeHandle) -> Option<uuid::Uuid> {
    let (node_type, id, path_id, path) = match handle {
      NodeHandle::Local(mut index) => {
        let node = self.nodes.get(index)?;
        if !node.node_type().is_container() && node.alias {
          index = *self.index.get(&node.minid)?;
        }
        let node = &self.nodes[index];
        let mut root = index;
        while let Some(parent) = self.nodes[root].parent {
          root = parent;
        }
        (node.node_type(), node.id, self.nodes[root].id, self.path(index))
      }
      NodeHandle::Remote(index) => {
        let remotes = self.remotes.lock().unwrap();
        let stub = remotes.get(index)?;
        let path = format!("{}{}", NodeType::Remote.letter(), stub.domain_id);
        (NodeType::Remote, stub.domain_id, minid_value(stub.minid), path)
      }
    };
    let low_id = match node_type {
      NodeType::Remote => id,
      _ => path_id,
    };
    let time_low = u32::from(node_type.code()) << 24 | low_id & 0x00ff_ffff;
    let packed = match node_type {
      NodeType::Remote => path_id,
      _ => id,
    };
    let digest = md5::compute(path.as_bytes());
    let mut folded = [0u8; 8];
    for (i, byte) in folded.iter_mut().enumerate() {
      *byte = digest[i * 2];
    }
    let d4 = [
      folded[6], folded[7], folded[0], folded[1], folded[2], folded[3], folded[4], folded[5],
    ];
    Some(uuid::Uuid::from_fields(
      time_low,
      (packed & 0xffff) as u16,
      (packed >> 16) as u16,
      &d4,
    ))
  }

  pub fn node_to_dn(&self, handle: NodeHandle) -> Result<String> {
    let user = self.user_info(handle).ok_or(Error::NotFound)?;
    let localpart = user.username.split('@').next().unwrap_or("");
    let domain_id = match handle {
      NodeHandle::Local(mut index) => {
        while let Some(parent) = self.nodes[index].parent {
          index = parent;
        }
        match &self.nodes[index].data {
          NodeData::Domain(domain) => domain.id,
          _ => return Err(Error::NotFound),
        }
      }
      NodeHandle::Remote(index) => {
        let remotes = self.remotes.lock().unwrap();
        remotes.get(index).ok_or(Error::NotFound)?.domain_id
      }
    };
    Ok(
      format!(
        "/o={}/ou=Exchange Administrative Group (FYDIBOHF23SPDLT)/cn=Recipients/cn={:08x}{:08x}-{}",
        self.org_name, domain_id, user.id, localpart,
      )
      .to_uppercase(),
    )
  }

  // String8 answers are constrained to the requested codepage's repertoire.
  pub fn fetchprop(&self, handle: NodeHandle, codepage: u32, tag: PropTag) -> Result<PropValue> {
    let user = self.user_info(handle).ok_or(Error::NotFound)?;
    let raw = user.properties.get(&tag).ok_or(Error::NotFound)?;
    let parse_error = || Error::Parse(format!("property {tag:?} holds {raw:?}"));
    match tag.prop_type() {
      propval::PT_BOOLEAN => Ok(PropValue::Bool(
        raw.parse::<i64>().map_err(|_| parse_error())? != 0,
      )),
      propval::PT_SHORT => Ok(PropValue::Short(raw.parse().map_err(|_| parse_error())?)),
      propval::PT_LONG => Ok(PropValue::Long(raw.parse().map_err(|_| parse_error())?)),
      propval::PT_I8 => Ok(PropValue::LongLong(raw.parse().map_err(|_| parse_error())?)),
      propval::PT_SYSTIME => {
        let unix: u64 = raw.parse().map_err(|_| parse_error())?;
        Ok(PropValue::FileTime(crate::rop::unix_to_nttime(unix)))
      }
      propval::PT_STRING8 => {
        let encoding = codepage_encoding(codepage);
        let (encoded, _, _) = encoding.encode(raw);
        let (decoded, _) = encoding.decode_without_bom_handling(&encoded);
        Ok(PropValue::String8(decoded.into_owned()))
      }
      propval::PT_UNICODE => Ok(PropValue::Unicode(raw.clone())),
      propval::PT_BINARY => Ok(PropValue::Binary(raw.clone().into_bytes())),
      t if t == propval::MV_FLAG | propval::PT_UNICODE => Ok(PropValue::StringArray(vec![raw.clone()])),
      _ => Err(Error::NotFound),
    }
  }
}

fn codepage_encoding(codepage: u32) -> &'static encoding_rs::Encoding {
  match codepage {
    932 => encoding_rs::SHIFT_JIS,
    936 => encoding_rs::GBK,
    950 => encoding_rs::BIG5,
    1251 => encoding_rs::WINDOWS_1251,
    1252 => encoding_rs::WINDOWS_1252,
    _ => encoding_rs::UTF_8,
  }
}

// A random GUID whose node field carries the base id in its first four bytes.
fn base_guid(base_id: i32) -> uuid::Uuid {
  let mut bytes = *uuid::Uuid::new_v4().as_bytes();
  bytes[10..14].copy_from_slice(&base_id.to_le_bytes());
  uuid::Uuid::from_bytes(bytes)
}

pub fn guid_base_id(guid: uuid::Uuid) -> i32 {
  let bytes = guid.as_bytes();
  i32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]])
}

struct Slot {
  status: u8,
  reference: u32,
  load_time: time::Instant,
  base: Option<sync::Arc<Base>>,
}

struct CacheInner {
  org_name: String,
  capacity: usize,
  interval: time::Duration,
  directory: sync::Arc<dyn Directory + Send + Sync>,
  bases: sync::Mutex<collections::HashMap<i32, Slot>>,
  stop: atomic::AtomicBool,
}

// Process-wide base cache: get_base hands out counted references, a background
// scanner rebuilds idle bases once they outlive the cache interval.
pub struct AbCache {
  inner: sync::Arc<CacheInner>,
  scanner: sync::Mutex<Option<thread::JoinHandle<()>>>,
}

pub struct BaseRef {
  inner: sync::Arc<CacheInner>,
  base_id: i32,
  base: sync::Arc<Base>,
}

impl std::ops::Deref for BaseRef {
  type Target = Base;

  fn deref(&self) -> &Base {
    &self.base
  }
}

impl Drop for BaseRef {
  fn drop(&mut self) {
    let mut bases = self.inner.bases.lock().unwrap();
    if let Some(slot) = bases.get_mut(&self.base_id) {
      slot.reference -= 1;
    }
  }
}

impl AbCache {
  pub fn new(
    org_name: &str,
    capacity: usize,
    interval: time::Duration,
    directory: sync::Arc<dyn Directory + Send + Sync>,
  ) -> Self {
    Self {
      inner: sync::Arc::new(CacheInner {
        org_name: org_name.to_string(),
        capacity,
        interval,
        directory,
        bases: sync::Mutex::new(collections::HashMap::new()),
        stop: atomic::AtomicBool::new(false),
      }),
      scanner: sync::Mutex::new(None),
    }
  }

  // Starts the TTL scanner; idempotent.
  pub fn run(&self) {
    let mut scanner = self.scanner.lock().unwrap();
    if scanner.is_some() {
      return;
    }
    let inner = sync::Arc::clone(&self.inner);
    *scanner = Some(thread::spawn(move || scan(inner)));
  }

  pub fn stop(&self) {
    self.inner.stop.store(true, atomic::Ordering::Relaxed);
    if let Some(handle) = self.scanner.lock().unwrap().take() {
      let _ = handle.join();
    }
  }

  pub fn get_base(&self, base_id: i32) -> Result<BaseRef> {
    for _ in 0..=60 {
      let constructing = {
        let mut bases = self.inner.bases.lock().unwrap();
        match bases.get_mut(&base_id) {
          None => {
            if bases.len() >= self.inner.capacity {
              log::warn!("address-book base cache is full, refusing base {base_id}");
              return Err(Error::OutOfMemory);
            }
            bases.insert(
              base_id,
              Slot {
                status: BASE_STATUS_CONSTRUCTING,
                reference: 0,
                load_time: time::Instant::now(),
                base: None,
              },
            );
            false
          }
          Some(slot) if slot.status == BASE_STATUS_LIVING => {
            slot.reference += 1;
            let base = sync::Arc::clone(slot.base.as_ref().expect("living base has data"));
            return Ok(BaseRef {
              inner: sync::Arc::clone(&self.inner),
              base_id,
              base,
            });
          }
          Some(_) => true,
        }
      };
      if constructing {
        // Someone else is constructing it; wait with a bounded retry.
        thread::sleep(time::Duration::from_secs(1));
        continue;
      }
      // We inserted the constructing slot; build outside the lock.
      match Base::load(base_id, &self.inner.org_name, self.inner.directory.as_ref()) {
        Ok(base) => {
          let base = sync::Arc::new(base);
          let mut bases = self.inner.bases.lock().unwrap();
          let slot = bases.get_mut(&base_id).expect("constructing slot");
          slot.base = Some(sync::Arc::clone(&base));
          slot.status = BASE_STATUS_LIVING;
          slot.load_time = time::Instant::now();
          slot.reference += 1;
          return Ok(BaseRef {
            inner: sync::Arc::clone(&self.inner),
            base_id,
            base,
          });
        }
        Err(error) => {
          log::error!("loading address-book base {base_id} failed: {error}");
          self.inner.bases.lock().unwrap().remove(&base_id);
          return Err(error);
        }
      }
    }
    Err(Error::RpcFailed)
  }

  // Resolves a recipient DN against a base, inserting a cross-base stub when
  // the DN names a domain outside the base.
  pub fn dn_to_node(&self, base: &Base, dn: &str) -> Option<NodeHandle> {
    let prefix = format!(
      "/o={}/ou=Exchange Administrative Group (FYDIBOHF23SPDLT)/cn=Recipients/cn=",
      base.org_name
    );
    if dn.len() < prefix.len() + 17 || !dn[..prefix.len()].eq_ignore_ascii_case(&prefix) {
      return None;
    }
    let rest = &dn[prefix.len()..];
    let domain_id = u32::from_str_radix(&rest[..8], 16).ok()?;
    let id = u32::from_str_radix(&rest[8..16], 16).ok()?;
    let minid = address_minid(id);
    if let Some(handle) = base.minid_to_node(minid) {
      return Some(handle);
    }
    // A domain the base covers but without that user: give up.
    if base
      .roots
      .iter()
      .any(|&root| base.nodes[root].id == domain_id)
    {
      return None;
    }
    let foreign = self.get_base(-(domain_id as i32)).ok()?;
    let foreign_handle = foreign.minid_to_node(minid)?;
    let data = foreign.with_node(foreign_handle, |node| node.data.clone())?;
    let mut remotes = base.remotes.lock().unwrap();
    remotes.push(RemoteStub {
      minid,
      domain_id,
      data,
    });
    Some(NodeHandle::Remote(remotes.len() - 1))
  }

  pub fn guid_base_id(&self, guid: uuid::Uuid) -> Option<i32> {
    let base_id = guid_base_id(guid);
    let bases = self.inner.bases.lock().unwrap();
    bases.contains_key(&base_id).then_some(base_id)
  }
}

fn scan(inner: sync::Arc<CacheInner>) {
  let tick = cmp::max(
    cmp::min(inner.interval, time::Duration::from_secs(1)),
    time::Duration::from_millis(10),
  );
  while !inner.stop.load(atomic::Ordering::Relaxed) {
    let expired = {
      let mut bases = inner.bases.lock().unwrap();
      let expired = bases.iter().find_map(|(&base_id, slot)| {
        (slot.status == BASE_STATUS_LIVING
          && slot.reference == 0
          && slot.load_time.elapsed() >= inner.interval)
          .then_some(base_id)
      });
      if let Some(base_id) = expired {
        bases.get_mut(&base_id).unwrap().status = BASE_STATUS_CONSTRUCTING;
      }
      expired
    };
    let base_id = match expired {
      Some(base_id) => base_id,
      None => {
        thread::sleep(tick);
        continue;
      }
    };
    match Base::load(base_id, &inner.org_name, inner.directory.as_ref()) {
      Ok(base) => {
        let mut bases = inner.bases.lock().unwrap();
        if let Some(slot) = bases.get_mut(&base_id) {
          slot.base = Some(sync::Arc::new(base));
          slot.status = BASE_STATUS_LIVING;
          slot.load_time = time::Instant::now();
        }
      }
      Err(error) => {
        log::error!("rebuilding address-book base {base_id} failed: {error}");
        inner.bases.lock().unwrap().remove(&base_id);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[derive(Default)]
  struct TestDirectory {
    loads: sync::Mutex<u32>,
  }

  fn user(id: u32, name: &str, display: Option<&str>, display_type: i32) -> UserInfo {
    let mut properties = collections::HashMap::new();
    if let Some(display) = display {
      properties.insert(propval::PR_DISPLAY_NAME, display.to_string());
    }
    properties.insert(propval::PR_TITLE, "engineer".to_string());
    UserInfo {
      id,
      username: name.to_string(),
      display_type,
      maildir: format!("/var/mail/{id}"),
      list_type: MLIST_TYPE_NORMAL,
      list_privilege: 0,
      properties,
      aliases: Vec::new(),
    }
  }

  impl Directory for TestDirectory {
    fn org_domains(&self, _org_id: u32) -> Result<Vec<u32>> {
      Ok(vec![20, 21])
    }

    fn domain_info(&self, domain_id: u32) -> Result<DomainInfo> {
      *self.loads.lock().unwrap() += 1;
      Ok(DomainInfo {
        id: domain_id,
        name: format!("d{domain_id}.example"),
        title: format!("Domain {domain_id}"),
        address: "1 Main St".to_string(),
      })
    }

    fn domain_groups(&self, domain_id: u32) -> Result<Vec<GroupInfo>> {
      if domain_id != 20 {
        return Ok(Vec::new());
      }
      Ok(vec![GroupInfo {
        id: 300,
        name: "eng".to_string(),
        title: "Engineering".to_string(),
      }])
    }

    fn group_classes(&self, _group_id: u32) -> Result<Vec<ClassInfo>> {
      Ok(vec![ClassInfo {
        id: 400,
        name: "Backend".to_string(),
      }])
    }

    fn sub_classes(&self, _class_id: u32) -> Result<Vec<ClassInfo>> {
      Ok(Vec::new())
    }

    fn class_users(&self, _class_id: u32) -> Result<Vec<UserInfo>> {
      Ok(vec![user(103, "carol@d20.example", Some("Carol"), propval::DT_MAILUSER)])
    }

    fn group_users(&self, _group_id: u32) -> Result<Vec<UserInfo>> {
      Ok(vec![
        user(102, "bob@d20.example", Some("bob"), propval::DT_MAILUSER),
        user(101, "alice@d20.example", Some("Alice"), propval::DT_MAILUSER),
      ])
    }

    fn domain_users(&self, domain_id: u32) -> Result<Vec<UserInfo>> {
      if domain_id == 20 {
        Ok(vec![user(104, "zack@d20.example", None, propval::DT_MAILUSER)])
      } else {
        Ok(vec![user(201, "room1@d21.example", Some("Room One"), DT_ROOM)])
      }
    }

    fn check_domain(&self, domain: &str) -> bool {
      domain == "d20.example" || domain == "d21.example"
    }

    fn check_same_org(&self, a: &str, b: &str) -> bool {
      self.check_domain(a) && self.check_domain(b)
    }
  }

  fn cache(interval: time::Duration) -> AbCache {
    AbCache::new(
      "First Organization",
      8,
      interval,
      sync::Arc::new(TestDirectory::default()),
    )
  }

  #[test]
  fn minid_packing() {
    assert_eq!(101, address_minid(101));
    assert_eq!(101, minid_value(address_minid(101)));
    assert_eq!(300, minid_value(make_minid(MINID_TYPE_GROUP, 300)));
    // Reserved low values move to the reserved type.
    assert_eq!(MINID_TYPE_RESERVED, address_minid(0x10) >> 29);
    assert_eq!(MINID_TYPE_ADDRESS, address_minid(0x11) >> 29);
  }

  #[test]
  fn gal_is_sorted_case_insensitively() -> anyhow::Result<()> {
    let cache = cache(time::Duration::from_secs(3600));
    let base = cache.get_base(1)?;
    let names: Vec<String> = base
      .gal()
      .into_iter()
      .map(|handle| base.display_name(handle).unwrap())
      .collect();
    let mut folded: Vec<String> = names.iter().map(|name| fold(name)).collect();
    let sorted = folded.clone();
    folded.sort();
    assert_eq!(sorted, folded);
    // Carol from the class, the sorted group pair, the fallback localpart and
    // the room from the second domain are all present exactly once.
    assert_eq!(vec!["Alice", "bob", "Carol", "Room One", "zack"], names);
    Ok(())
  }

  #[test]
  fn queries() -> anyhow::Result<()> {
    let cache = cache(time::Duration::from_secs(3600));
    let base = cache.get_base(1)?;
    let alice = base.uid_to_node(101).unwrap();
    assert_eq!(Some(NodeType::Person), base.node_type(alice));
    assert_eq!(Some(address_minid(101)), base.node_minid(alice));
    assert_eq!(base.minid_to_node(address_minid(101)), Some(alice));
    assert_eq!(Some("Engineering".to_string()), base.department_name(alice));
    assert_eq!(
      Some(("Domain 20".to_string(), "1 Main St".to_string())),
      base.company_info(alice)
    );
    let room = base.uid_to_node(201).unwrap();
    assert_eq!(Some(NodeType::Room), base.node_type(room));
    let dn = base.node_to_dn(alice)?;
    assert!(dn.starts_with("/O=FIRST ORGANIZATION/OU=EXCHANGE ADMINISTRATIVE GROUP"));
    assert!(dn.ends_with(&format!("CN={:08X}{:08X}-ALICE", 20, 101)));
    Ok(())
  }

  #[test]
  fn node_guids_are_deterministic_and_distinct() -> anyhow::Result<()> {
    let cache = cache(time::Duration::from_secs(3600));
    let base = cache.get_base(1)?;
    let alice = base.uid_to_node(101).unwrap();
    let bob = base.uid_to_node(102).unwrap();
    assert_eq!(base.node_to_guid(alice), base.node_to_guid(alice));
    assert_ne!(base.node_to_guid(alice), base.node_to_guid(bob));
    Ok(())
  }

  #[test]
  fn fetchprop_types() -> anyhow::Result<()> {
    let cache = cache(time::Duration::from_secs(3600));
    let base = cache.get_base(1)?;
    let alice = base.uid_to_node(101).unwrap();
    assert_eq!(
      PropValue::Unicode("engineer".to_string()),
      base.fetchprop(alice, 1252, propval::PR_TITLE)?
    );
    assert_eq!(
      Err(Error::NotFound),
      base.fetchprop(alice, 1252, propval::PR_COMMENT)
    );
    Ok(())
  }

  #[test]
  fn dn_roundtrip_and_remote_stub() -> anyhow::Result<()> {
    let cache = cache(time::Duration::from_secs(3600));
    // A single-domain base only covers domain 20.
    let base = cache.get_base(-20)?;
    let alice = base.uid_to_node(101).unwrap();
    let dn = base.node_to_dn(alice)?;
    assert_eq!(Some(alice), cache.dn_to_node(&base, &dn));
    // Resolving a DN of domain 21 pulls a stub from the foreign base.
    let foreign = cache.get_base(-21)?;
    let room_dn = foreign.node_to_dn(foreign.uid_to_node(201).unwrap())?;
    let stub = cache.dn_to_node(&base, &room_dn).unwrap();
    assert_eq!(Some(NodeType::Remote), base.node_type(stub));
    assert_eq!(Some("Room One".to_string()), base.display_name(stub));
    // Stubs are not GAL members.
    assert_eq!(4, base.gal().len());
    Ok(())
  }

  #[test]
  fn base_guid_encodes_base_id() {
    assert_eq!(-20, guid_base_id(base_guid(-20)));
  }

  #[test]
  fn scanner_rebuilds_idle_bases() -> anyhow::Result<()> {
    let directory = sync::Arc::new(TestDirectory::default());
    let cache = AbCache::new(
      "First Organization",
      8,
      time::Duration::from_millis(30),
      sync::Arc::clone(&directory) as sync::Arc<dyn Directory + Send + Sync>,
    );
    cache.run();
    {
      let _base = cache.get_base(-20)?;
      // Held references block the rebuild.
      let loads = *directory.loads.lock().unwrap();
      thread::sleep(time::Duration::from_millis(120));
      assert_eq!(loads, *directory.loads.lock().unwrap());
    }
    thread::sleep(time::Duration::from_millis(120));
    let reloaded = *directory.loads.lock().unwrap();
    assert!(reloaded > 1, "scanner should have rebuilt the base");
    cache.stop();
    Ok(())
  }
}
