// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxorule - rule model
//
// One delivery invocation walks the target folder's standard and extended
// rules in ascending sequence order, evaluates each condition against the
// freshly delivered message and materialises the actions. The engine runs on
// the delivering worker's thread; every store call blocks.

use crate::abtree::Directory;
use crate::autoreply::{self, BounceAudit};
use crate::booking;
use crate::namedprop;
use crate::propval::{
  self, MessageContent, PropTag, PropValue, PropertyBag, PID_TAG_CHANGE_NUMBER, PID_TAG_MID,
  PR_CHANGE_KEY, PR_LAST_MODIFICATION_TIME, PR_LOCAL_COMMIT_TIME, PR_MESSAGE_CLASS,
  PR_PREDECESSOR_CHANGE_LIST,
};
use crate::restriction::{self, BitmaskRelation, ContentRestriction, MatchMode, Restriction};
use crate::rop::{self, Pcl, Xid};
use crate::store::{
  self, Error, FolderEntryId, MailQueue, Result, SortOrder, Store, StoreEntryId,
};
use std::collections;

pub mod extended;

pub const OP_MOVE: u8 = 0x01;
pub const OP_COPY: u8 = 0x02;
pub const OP_REPLY: u8 = 0x03;
pub const OP_OOF_REPLY: u8 = 0x04;
pub const OP_DEFER_ACTION: u8 = 0x05;
pub const OP_BOUNCE: u8 = 0x06;
pub const OP_FORWARD: u8 = 0x07;
pub const OP_DELEGATE: u8 = 0x08;
pub const OP_TAG: u8 = 0x09;
pub const OP_DELETE: u8 = 0x0a;
pub const OP_MARK_AS_READ: u8 = 0x0b;

// Rule state bits.
pub const ST_ENABLED: u32 = 0x01;
pub const ST_ERROR: u32 = 0x02;
pub const ST_ONLY_WHEN_OOF: u32 = 0x04;
pub const ST_EXIT_LEVEL: u32 = 0x10;
pub const ST_SKIP_IF_SCL_OVER: u32 = 0x20;
pub const ST_PARSE_ERROR: u32 = 0x40;

#[derive(Clone, Debug, PartialEq)]
pub enum MoveCopyTarget {
  SameStore {
    folder_id: u64,
  },
  CrossStore {
    store_eid: StoreEntryId,
    folder: Option<FolderEntryId>,
  },
}

#[derive(Clone, Debug, PartialEq)]
pub enum ActionBlock {
  Move(MoveCopyTarget),
  Copy(MoveCopyTarget),
  Reply,
  OofReply,
  Defer(Vec<u8>),
  Bounce(u32),
  Forward(Vec<PropertyBag>),
  Delegate(Vec<PropertyBag>),
  Tag(PropTag, PropValue),
  Delete,
  MarkAsRead,
}

fn action_name(block: &ActionBlock) -> &'static str {
  match block {
    ActionBlock::Move(_) => "move",
    ActionBlock::Copy(_) => "copy",
    ActionBlock::Reply => "reply",
    ActionBlock::OofReply => "oof-reply",
    ActionBlock::Defer(_) => "defer",
    ActionBlock::Bounce(_) => "bounce",
    ActionBlock::Forward(_) => "forward",
    ActionBlock::Delegate(_) => "delegate",
    ActionBlock::Tag(..) => "tag",
    ActionBlock::Delete => "delete",
    ActionBlock::MarkAsRead => "mark-as-read",
  }
}

#[derive(Debug)]
enum RuleActions {
  Standard(Vec<ActionBlock>),
  Extended(Vec<extended::ExtAction>),
}

#[derive(Debug)]
struct RuleNode {
  seq: i32,
  state: u32,
  rule_id: u64,
  name: String,
  provider: String,
  condition: Option<Restriction>,
  actions: RuleActions,
}

fn state_filter(state_tag: PropTag, oof: bool) -> Restriction {
  Restriction::And(vec![
    Restriction::Exist(state_tag),
    Restriction::Or(vec![
      Restriction::Bitmask {
        relation: BitmaskRelation::NotEqualToZero,
        tag: state_tag,
        mask: ST_ENABLED,
      },
      Restriction::Bitmask {
        relation: BitmaskRelation::NotEqualToZero,
        tag: state_tag,
        mask: if oof { ST_ONLY_WHEN_OOF } else { 0 },
      },
    ]),
  ])
}

fn load_std_rules(store: &dyn Store, dir: &str, folder_id: u64, oof: bool, rules: &mut Vec<RuleNode>) -> Result<()> {
  let filter = state_filter(propval::PR_RULE_STATE, oof);
  let (table_id, row_count) = store.load_rule_table(dir, folder_id, Some(&filter))?;
  let columns = [
    propval::PR_RULE_STATE,
    propval::PR_RULE_ID,
    propval::PR_RULE_SEQUENCE,
    propval::PR_RULE_NAME,
    propval::PR_RULE_PROVIDER,
    propval::PR_RULE_CONDITION,
    propval::PR_RULE_ACTIONS,
  ];
  let queried = store.query_table(dir, table_id, &columns, 0, row_count);
  if let Err(error) = store.unload_table(dir, table_id) {
    log::warn!("unloading rule table failed: {error}");
  }
  for row in queried? {
    let (seq, state, rule_id) = match (
      row.get_long(propval::PR_RULE_SEQUENCE),
      row.get_long(propval::PR_RULE_STATE),
      row.get_longlong(propval::PR_RULE_ID),
    ) {
      (Some(seq), Some(state), Some(rule_id)) => (seq, state as u32, rule_id as u64),
      _ => continue,
    };
    let condition = match row.get(propval::PR_RULE_CONDITION) {
      Some(PropValue::Restriction(restriction)) => Some((**restriction).clone()),
      _ => None,
    };
    let actions = match row.get(propval::PR_RULE_ACTIONS) {
      Some(PropValue::RuleActions(actions)) => actions.clone(),
      _ => Vec::new(),
    };
    rules.push(RuleNode {
      seq,
      state,
      rule_id,
      name: row.get_str(propval::PR_RULE_NAME).unwrap_or("").to_string(),
      provider: row.get_str(propval::PR_RULE_PROVIDER).unwrap_or("").to_string(),
      condition,
      actions: RuleActions::Standard(actions),
    });
  }
  Ok(())
}

// Maps the named ids carried inside an extended-rule blob to this store's ids.
fn resolve_ext_names(
  store: &dyn Store,
  dir: &str,
  info: &extended::NamedPropInfo,
) -> Result<collections::HashMap<u16, u16>> {
  if info.propids.is_empty() {
    return Ok(collections::HashMap::new());
  }
  let resolved = store.get_named_propids(dir, true, &info.names)?;
  if resolved.len() != info.propids.len() {
    return Err(Error::InvariantViolated(format!(
      "asked {} propids, got {}",
      info.propids.len(),
      resolved.len()
    )));
  }
  Ok(info.propids.iter().copied().zip(resolved).collect())
}

fn remap_tag(map: &collections::HashMap<u16, u16>, tag: PropTag) -> PropTag {
  match map.get(&tag.id()) {
    Some(&id) if tag.is_named() => tag.with_id(id),
    _ => tag,
  }
}

fn load_ext_rules(store: &dyn Store, dir: &str, folder_id: u64, oof: bool, rules: &mut Vec<RuleNode>) -> Result<()> {
  let filter = Restriction::And(vec![
    Restriction::Exist(propval::PR_RULE_MSG_STATE),
    Restriction::Or(vec![
      Restriction::Bitmask {
        relation: BitmaskRelation::NotEqualToZero,
        tag: propval::PR_RULE_MSG_STATE,
        mask: ST_ENABLED,
      },
      Restriction::Bitmask {
        relation: BitmaskRelation::NotEqualToZero,
        tag: propval::PR_RULE_MSG_STATE,
        mask: if oof { ST_ONLY_WHEN_OOF } else { 0 },
      },
    ]),
    Restriction::Exist(PR_MESSAGE_CLASS),
    Restriction::Content(ContentRestriction {
      mode: MatchMode::FullString,
      ignore_case: true,
      loose: false,
      tag: PR_MESSAGE_CLASS,
      value: PropValue::Unicode("IPM.ExtendedRule.Message".to_string()),
    }),
  ]);
  let sorts = [SortOrder {
    tag: propval::PR_RULE_MSG_SEQUENCE,
    descending: false,
  }];
  let (table_id, row_count) =
    store.load_content_table(dir, folder_id, store::TABLE_FLAG_ASSOCIATED, Some(&filter), &sorts)?;
  let columns = [
    propval::PR_RULE_MSG_STATE,
    PID_TAG_MID,
    propval::PR_RULE_MSG_SEQUENCE,
    propval::PR_RULE_MSG_NAME,
    propval::PR_RULE_MSG_PROVIDER,
  ];
  let queried = store.query_table(dir, table_id, &columns, 0, row_count);
  if let Err(error) = store.unload_table(dir, table_id) {
    log::warn!("unloading associated-contents table failed: {error}");
  }
  for row in queried? {
    let (seq, state, message_id) = match (
      row.get_long(propval::PR_RULE_MSG_SEQUENCE),
      row.get_long(propval::PR_RULE_MSG_STATE),
      row.get_longlong(PID_TAG_MID),
    ) {
      (Some(seq), Some(state), Some(message_id)) => (seq, state as u32, message_id as u64),
      _ => continue,
    };
    let blobs = match store.get_message_properties(
      dir,
      message_id,
      &[propval::PR_EXTENDED_RULE_MSG_CONDITION, propval::PR_EXTENDED_RULE_MSG_ACTIONS],
    ) {
      Ok(blobs) => blobs,
      Err(_) => continue,
    };
    let action_blob = match blobs.get_bytes(propval::PR_EXTENDED_RULE_MSG_ACTIONS) {
      Some(blob) if !blob.is_empty() => blob,
      _ => continue,
    };
    // A malformed blob drops this rule only; the remaining rules proceed.
    let (action_names, mut actions) = match extended::parse_actions(action_blob) {
      Ok(parsed) => parsed,
      Err(error) => {
        log::warn!("extended rule {message_id:x} in {dir} dropped: {error}");
        continue;
      }
    };
    let map = match resolve_ext_names(store, dir, &action_names) {
      Ok(map) => map,
      Err(error) => {
        log::warn!("extended rule {message_id:x} in {dir} dropped: {error}");
        continue;
      }
    };
    for action in actions.iter_mut() {
      if let extended::ExtAction::Tag(tag, _) = action {
        *tag = remap_tag(&map, *tag);
      }
    }
    let condition = match blobs.get_bytes(propval::PR_EXTENDED_RULE_MSG_CONDITION) {
      Some(blob) if !blob.is_empty() => match extended::parse_condition(blob) {
        Ok((condition_names, mut condition)) => {
          let map = match resolve_ext_names(store, dir, &condition_names) {
            Ok(map) => map,
            Err(error) => {
              log::warn!("extended rule {message_id:x} in {dir} dropped: {error}");
              continue;
            }
          };
          condition.map_tags(&mut |tag| remap_tag(&map, tag));
          Some(condition)
        }
        Err(error) => {
          log::warn!("extended rule {message_id:x} in {dir} dropped: {error}");
          continue;
        }
      },
      _ => None,
    };
    rules.push(RuleNode {
      seq,
      state,
      rule_id: message_id,
      name: row.get_str(propval::PR_RULE_MSG_NAME).unwrap_or("").to_string(),
      provider: row.get_str(propval::PR_RULE_MSG_PROVIDER).unwrap_or("").to_string(),
      condition,
      actions: RuleActions::Extended(actions),
    });
  }
  Ok(())
}

fn is_oof(store: &dyn Store, dir: &str) -> Result<bool> {
  let props = store.get_store_properties(dir, &[propval::PR_OOF_STATE])?;
  Ok(props.get_bool(propval::PR_OOF_STATE).unwrap_or(false))
}

// The store's replication namespace GUID, for change keys written on behalf of
// the mailbox.
pub(crate) fn store_xid(store: &dyn Store, dir: &str, cn: u64) -> Result<Xid> {
  let props = store.get_store_properties(dir, &[propval::PR_STORE_RECORD_KEY])?;
  let guid = match props.get_bytes(propval::PR_STORE_RECORD_KEY) {
    Some(bytes) if bytes.len() == 16 => {
      uuid::Uuid::from_bytes_le(<[u8; 16]>::try_from(bytes).unwrap())
    }
    _ => uuid::Uuid::nil(),
  };
  Ok(Xid::new(guid, cn))
}

#[derive(Clone, Debug)]
struct Cursor {
  dir: String,
  folder_id: u64,
  message_id: u64,
}

struct RunState {
  cursor: Cursor,
  // Folders already targeted by a move/copy in this delivery, plus the inbox.
  loop_check: collections::HashSet<(String, u64)>,
  content: MessageContent,
  deleted: bool,
  exit: bool,
}

enum AfterFailure {
  NextAction,
  NextRule,
}

pub struct Delivery<'a> {
  pub store: &'a dyn Store,
  pub directory: &'a dyn Directory,
  pub queue: &'a dyn MailQueue,
  pub audit: &'a BounceAudit,
}

impl Delivery<'_> {
  // Entry point for one freshly delivered message.
  pub fn execute(
    &self,
    dir: &str,
    envelope_from: &str,
    envelope_to: &str,
    folder_id: u64,
    message_id: u64,
  ) -> Result<()> {
    let oof = is_oof(self.store, dir)?;
    let mut rules = Vec::new();
    load_std_rules(self.store, dir, folder_id, oof, &mut rules)?;
    load_ext_rules(self.store, dir, folder_id, oof, &mut rules)?;
    rules.sort_by_key(|rule| rule.seq);
    let content = self.store.read_message(dir, message_id)?;
    let mut run = RunState {
      cursor: Cursor {
        dir: dir.to_string(),
        folder_id,
        message_id,
      },
      loop_check: collections::HashSet::from([(dir.to_string(), folder_id)]),
      content,
      deleted: false,
      exit: false,
    };
    for rule in &rules {
      self.process_rule(&mut run, rule, dir, envelope_from, envelope_to)?;
    }
    if !run.deleted && booking::is_resource_request(&run.content) {
      let policy = booking::policy(self.store, dir)?;
      booking::process(
        self.store,
        &run.cursor.dir,
        run.cursor.message_id,
        &mut run.content,
        policy,
      )?;
    }
    if run.deleted {
      if let Err(error) = self.store.delete_messages(
        &run.cursor.dir,
        run.cursor.folder_id,
        &[run.cursor.message_id],
        true,
      ) {
        log::error!("rule-driven deletion in {} failed: {error}", run.cursor.dir);
      }
      return Ok(());
    }
    // Clients only learn about the message once post-processing succeeded.
    if let Err(error) =
      self
        .store
        .notify_new_mail(&run.cursor.dir, run.cursor.folder_id, run.cursor.message_id)
    {
      log::error!("new-mail notification in {} failed: {error}", run.cursor.dir);
    }
    Ok(())
  }

  fn process_rule(
    &self,
    run: &mut RunState,
    rule: &RuleNode,
    mailbox_dir: &str,
    envelope_from: &str,
    envelope_to: &str,
  ) -> Result<()> {
    if run.exit && rule.state & ST_ONLY_WHEN_OOF == 0 {
      return Ok(());
    }
    if let Some(condition) = &rule.condition {
      if !restriction::eval_message(condition, &run.content) {
        return Ok(());
      }
    }
    if rule.state & ST_EXIT_LEVEL != 0 {
      run.exit = true;
    }
    match &rule.actions {
      RuleActions::Standard(blocks) => {
        for block in blocks {
          if let Err(error) = self.dispatch(run, block, mailbox_dir, envelope_from, envelope_to) {
            let fatal_to_rule = matches!(block, ActionBlock::Move(_) | ActionBlock::Copy(_));
            match failure_policy(rule, action_name(block), fatal_to_rule, error)? {
              AfterFailure::NextAction => continue,
              AfterFailure::NextRule => break,
            }
          }
        }
      }
      RuleActions::Extended(blocks) => {
        for block in blocks {
          if let Err(error) = self.dispatch_ext(run, block) {
            match failure_policy(rule, "extended", false, error)? {
              AfterFailure::NextAction => continue,
              AfterFailure::NextRule => break,
            }
          }
        }
      }
    }
    Ok(())
  }

  fn dispatch(
    &self,
    run: &mut RunState,
    block: &ActionBlock,
    mailbox_dir: &str,
    envelope_from: &str,
    envelope_to: &str,
  ) -> Result<()> {
    match block {
      ActionBlock::Move(target) => self.move_copy(run, target, true, envelope_to),
      ActionBlock::Copy(target) => self.move_copy(run, target, false, envelope_to),
      ActionBlock::Tag(tag, value) => self.tag(run, *tag, value.clone()),
      ActionBlock::MarkAsRead => self.mark_read(run),
      ActionBlock::Delete => {
        // Final, but deferred: later rules still see the message.
        run.deleted = true;
        Ok(())
      }
      ActionBlock::Reply | ActionBlock::OofReply => autoreply::respond(
        self.store,
        self.directory,
        self.queue,
        self.audit,
        mailbox_dir,
        envelope_from,
        envelope_to,
      )
      .map(|_| ()),
      other => {
        log::debug!("rule action {} is not handled here", action_name(other));
        Ok(())
      }
    }
  }

  fn dispatch_ext(&self, run: &mut RunState, action: &extended::ExtAction) -> Result<()> {
    match action {
      extended::ExtAction::MarkAsRead => self.mark_read(run),
      extended::ExtAction::Tag(tag, value) => self.tag(run, *tag, value.clone()),
      extended::ExtAction::Delete => {
        run.deleted = true;
        Ok(())
      }
      // Forward compatibility: unknown types are ignored without failing.
      extended::ExtAction::Unknown(action_type) => {
        log::debug!("extended action {action_type:#x} ignored");
        Ok(())
      }
    }
  }

  fn move_copy(&self, run: &mut RunState, target: &MoveCopyTarget, is_move: bool, envelope_to: &str) -> Result<()> {
    match target {
      MoveCopyTarget::SameStore { folder_id } => {
        if rop::replid(*folder_id) != 1 {
          return Err(Error::NotFound);
        }
        let key = (run.cursor.dir.clone(), *folder_id);
        if run.loop_check.contains(&key) {
          return Err(Error::LoopDetected);
        }
        let new_message_id = self.store.allocate_message_id(&run.cursor.dir, *folder_id)?;
        self.store.movecopy_message(
          &run.cursor.dir,
          run.cursor.message_id,
          *folder_id,
          new_message_id,
          is_move,
        )?;
        run.loop_check.insert(key);
        if is_move {
          run.cursor.folder_id = *folder_id;
          run.cursor.message_id = new_message_id;
        }
        Ok(())
      }
      MoveCopyTarget::CrossStore { store_eid, folder } => {
        self.move_copy_other(run, store_eid, folder.as_ref(), is_move, envelope_to)
      }
    }
  }

  fn move_copy_other(
    &self,
    run: &mut RunState,
    store_eid: &StoreEntryId,
    folder: Option<&FolderEntryId>,
    is_move: bool,
    envelope_to: &str,
  ) -> Result<()> {
    let resolved = self.store.store_eid_to_user(&run.cursor.dir, store_eid)?;
    let dst_folder = match folder {
      None => rop::make_eid(
        1,
        if store_eid.public {
          store::PUBLIC_FID_IPMSUBTREE
        } else {
          store::PRIVATE_FID_INBOX
        },
      ),
      Some(folder) => {
        // The folder flavour must agree with the store it points into.
        if folder.public != store_eid.public {
          return Err(Error::NotFound);
        }
        rop::make_eid(1, folder.global_counter)
      }
    };
    let key = (resolved.dir.clone(), dst_folder);
    if run.loop_check.contains(&key) {
      return Err(Error::LoopDetected);
    }
    let permission = self.store.get_folder_perm(&resolved.dir, dst_folder, envelope_to)?;
    if permission & (store::PERMISSION_OWNER | store::PERMISSION_CREATE) == 0 {
      return Err(Error::AccessDenied);
    }
    let mut copy = run.content.clone();
    namedprop::replace_npids(&mut copy, self.store, &run.cursor.dir, &resolved.dir)?;
    let dst_message_id = self.store.allocate_message_id(&resolved.dir, dst_folder)?;
    let dst_cn = self.store.allocate_cn(&resolved.dir)?;
    let guid = if store_eid.public {
      rop::make_domain_guid(resolved.domain_id)
    } else {
      rop::make_user_guid(resolved.user_id)
    };
    let xid = Xid::new(guid, dst_cn);
    let mut pcl = Pcl::new();
    pcl.append(xid);
    let props = &mut copy.properties;
    if !props.has(PR_LAST_MODIFICATION_TIME) {
      props.set(PR_LAST_MODIFICATION_TIME, PropValue::FileTime(rop::current_nttime()));
    }
    props.set(PID_TAG_MID, PropValue::LongLong(dst_message_id as i64));
    props.set(PID_TAG_CHANGE_NUMBER, PropValue::LongLong(dst_cn as i64));
    props.set(PR_CHANGE_KEY, PropValue::Binary(xid.to_bytes().to_vec()));
    props.set(PR_PREDECESSOR_CHANGE_LIST, PropValue::Binary(pcl.serialize()));
    self.store.write_message(&resolved.dir, dst_folder, &copy)?;
    run.loop_check.insert(key);
    if !is_move {
      return Ok(());
    }
    if let Err(error) = self.store.delete_messages(
      &run.cursor.dir,
      run.cursor.folder_id,
      &[run.cursor.message_id],
      true,
    ) {
      log::error!(
        "deleting {:x} from {} after a cross-store move failed: {error}",
        run.cursor.message_id,
        run.cursor.dir
      );
    }
    run.cursor = Cursor {
      dir: resolved.dir,
      folder_id: dst_folder,
      message_id: dst_message_id,
    };
    Ok(())
  }

  // One store write: the tagged property plus change bookkeeping.
  fn tag(&self, run: &mut RunState, tag: PropTag, value: PropValue) -> Result<()> {
    let cn = self.store.allocate_cn(&run.cursor.dir)?;
    let xid = store_xid(self.store, &run.cursor.dir, cn)?;
    let mut update = self.change_update(run, cn, xid)?;
    update.set(tag, value);
    self
      .store
      .set_message_properties(&run.cursor.dir, run.cursor.message_id, &update)
  }

  fn mark_read(&self, run: &mut RunState) -> Result<()> {
    let cn = self
      .store
      .set_message_read_state(&run.cursor.dir, run.cursor.message_id, true)?;
    let xid = store_xid(self.store, &run.cursor.dir, cn)?;
    let update = self.change_update(run, cn, xid)?;
    self
      .store
      .set_message_properties(&run.cursor.dir, run.cursor.message_id, &update)
  }

  fn change_update(&self, run: &RunState, cn: u64, xid: Xid) -> Result<PropertyBag> {
    let props = self.store.get_message_properties(
      &run.cursor.dir,
      run.cursor.message_id,
      &[PR_PREDECESSOR_CHANGE_LIST],
    )?;
    let mut pcl = match props.get_bytes(PR_PREDECESSOR_CHANGE_LIST) {
      Some(bytes) => Pcl::from_bytes(bytes)?,
      None => Pcl::new(),
    };
    pcl.append(xid);
    let now = rop::current_nttime();
    let mut update = PropertyBag::new();
    update.set(PID_TAG_CHANGE_NUMBER, PropValue::LongLong(cn as i64));
    update.set(PR_CHANGE_KEY, PropValue::Binary(xid.to_bytes().to_vec()));
    update.set(PR_PREDECESSOR_CHANGE_LIST, PropValue::Binary(pcl.serialize()));
    update.set(PR_LOCAL_COMMIT_TIME, PropValue::FileTime(now));
    update.set(PR_LAST_MODIFICATION_TIME, PropValue::FileTime(now));
    Ok(update)
  }
}

fn failure_policy(rule: &RuleNode, action: &str, fatal_to_rule: bool, error: Error) -> Result<AfterFailure> {
  match error {
    Error::LoopDetected => {
      log::debug!("rule {:x} ({}): {action} skipped, folder already visited", rule.rule_id, rule.name);
      Ok(AfterFailure::NextAction)
    }
    Error::NotFound => {
      log::debug!("rule {:x} ({}): {action} target not found, skipped", rule.rule_id, rule.name);
      Ok(AfterFailure::NextAction)
    }
    Error::AccessDenied | Error::RpcFailed => {
      log::warn!("rule {:x} ({}, provider {}): {action} failed: {error}", rule.rule_id, rule.name, rule.provider);
      Ok(if fatal_to_rule {
        AfterFailure::NextRule
      } else {
        AfterFailure::NextAction
      })
    }
    error => Err(error),
  }
}
