// The message store lives in a collocated process; everything here models its
// RPC surface. Calls block until the store answers and any transport problem
// surfaces as Error::RpcFailed.

use crate::namedprop::PropertyName;
use crate::propval::{MessageContent, PropTag, PropertyBag};
use crate::restriction::Restriction;
use std::{error, fmt, result};

// Well-known folder identifiers (global-counter part).
pub const PRIVATE_FID_INBOX: u64 = 0x0d;
pub const PRIVATE_FID_CALENDAR: u64 = 0x10;
pub const PUBLIC_FID_IPMSUBTREE: u64 = 0x02;

// Folder permission bits.
pub const PERMISSION_READ_ANY: u32 = 0x1;
pub const PERMISSION_CREATE: u32 = 0x2;
pub const PERMISSION_OWNER: u32 = 0x100;

// Table flags.
pub const TABLE_FLAG_ASSOCIATED: u32 = 0x2;
pub const TABLE_FLAG_NONOTIFICATIONS: u32 = 0x80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
  // Object or name absent; rule actions skip and processing continues.
  NotFound,
  // Permission check failed; fatal to the current action only.
  AccessDenied,
  // Transport failure or store-side timeout; fatal to the current action.
  RpcFailed,
  // Counter regression, id mismatch, PCL corruption; fatal to the delivery.
  InvariantViolated(String),
  OutOfMemory,
  // A move/copy would revisit a folder already on the chain; skipped silently.
  LoopDetected,
  // Malformed extended-rule payload; the rule is dropped.
  Parse(String),
}

impl fmt::Display for Error {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Self::NotFound => write!(formatter, "not found"),
      Self::AccessDenied => write!(formatter, "access denied"),
      Self::RpcFailed => write!(formatter, "store RPC failed"),
      Self::InvariantViolated(what) => write!(formatter, "invariant violated: {what}"),
      Self::OutOfMemory => write!(formatter, "out of memory"),
      Self::LoopDetected => write!(formatter, "move/copy loop detected"),
      Self::Parse(what) => write!(formatter, "parse error: {what}"),
    }
  }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;

// Reference to a message store as carried inside move/copy action payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEntryId {
  pub public: bool,
  pub server_name: String,
}

// A same-flavour folder reference inside a foreign store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FolderEntryId {
  pub public: bool,
  pub global_counter: u64,
}

#[derive(Clone, Debug)]
pub struct ResolvedStore {
  pub dir: String,
  pub user_id: u32,
  pub domain_id: u32,
}

// The stable (instance, type) tuple a bookmark captures for one row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableMark {
  pub inst_id: u64,
  pub inst_num: u32,
  pub row_type: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortOrder {
  pub tag: PropTag,
  pub descending: bool,
}

pub trait Store {
  fn get_store_properties(&self, dir: &str, tags: &[PropTag]) -> Result<PropertyBag>;
  fn get_folder_perm(&self, dir: &str, folder_id: u64, username: &str) -> Result<u32>;

  // Table loads answer (table id, row count).
  fn load_rule_table(&self, dir: &str, folder_id: u64, restriction: Option<&Restriction>) -> Result<(u32, u32)>;
  fn load_content_table(
    &self,
    dir: &str,
    folder_id: u64,
    flags: u32,
    restriction: Option<&Restriction>,
    sorts: &[SortOrder],
  ) -> Result<(u32, u32)>;
  fn load_hierarchy_table(&self, dir: &str, folder_id: u64, flags: u32, restriction: Option<&Restriction>) -> Result<(u32, u32)>;
  fn load_permission_table(&self, dir: &str, folder_id: u64, flags: u32) -> Result<(u32, u32)>;
  fn sum_table(&self, dir: &str, table_id: u32) -> Result<u32>;
  fn query_table(&self, dir: &str, table_id: u32, columns: &[PropTag], start: u32, count: u32) -> Result<Vec<PropertyBag>>;
  fn mark_table(&self, dir: &str, table_id: u32, position: u32) -> Result<TableMark>;
  // None: the instance is gone from the table.
  fn locate_table(&self, dir: &str, table_id: u32, inst_id: u64, inst_num: u32) -> Result<Option<(u32, u32)>>;
  // (position, row-count delta) when the category row was found.
  fn expand_table(&self, dir: &str, table_id: u32, inst_id: u64) -> Result<Option<(u32, u32)>>;
  fn collapse_table(&self, dir: &str, table_id: u32, inst_id: u64) -> Result<Option<(u32, u32)>>;
  fn store_table_state(&self, dir: &str, table_id: u32, inst_id: u64, inst_num: u32) -> Result<u32>;
  fn restore_table_state(&self, dir: &str, table_id: u32, state_id: u32) -> Result<Option<u32>>;
  fn unload_table(&self, dir: &str, table_id: u32) -> Result<()>;

  fn get_message_properties(&self, dir: &str, message_id: u64, tags: &[PropTag]) -> Result<PropertyBag>;
  fn read_message(&self, dir: &str, message_id: u64) -> Result<MessageContent>;
  fn write_message(&self, dir: &str, folder_id: u64, message: &MessageContent) -> Result<()>;
  fn delete_messages(&self, dir: &str, folder_id: u64, message_ids: &[u64], hard: bool) -> Result<()>;
  fn set_message_properties(&self, dir: &str, message_id: u64, properties: &PropertyBag) -> Result<()>;
  // Answers the change number consumed by the read-state flip.
  fn set_message_read_state(&self, dir: &str, message_id: u64, read: bool) -> Result<u64>;

  fn allocate_cn(&self, dir: &str) -> Result<u64>;
  fn allocate_message_id(&self, dir: &str, folder_id: u64) -> Result<u64>;
  fn movecopy_message(&self, dir: &str, message_id: u64, folder_id: u64, new_message_id: u64, del: bool) -> Result<()>;

  fn get_named_propids(&self, dir: &str, create: bool, names: &[PropertyName]) -> Result<Vec<u16>>;
  fn get_named_propnames(&self, dir: &str, ids: &[u16]) -> Result<Vec<PropertyName>>;

  fn notify_new_mail(&self, dir: &str, folder_id: u64, message_id: u64) -> Result<()>;
  // Number of non-tentative events overlapping [start, end] (NT time).
  fn appt_meetreq_overlap(&self, dir: &str, start: u64, end: u64) -> Result<u32>;
  fn store_eid_to_user(&self, dir: &str, store_eid: &StoreEntryId) -> Result<ResolvedStore>;
  fn check_contact_address(&self, dir: &str, address: &str) -> Result<bool>;
}

// Outbound MTA queue; auto-replies are handed over here fully formed.
pub trait MailQueue {
  fn enqueue(&self, envelope_from: &str, envelope_to: &str, content: &[u8]) -> Result<()>;
}
