// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxctabl - table semantics
//
// A table is the read-side state machine clients observe: unloaded → loading →
// loaded → (unloaded | reset). The store owns the row set and issues a table id
// at load time; attachment tables are synthetic and never talk to the store.
// Any store failure leaves columns, sort, restriction and position untouched.

use crate::propval::{PropTag, PropValue, PropertyBag};
use crate::restriction::Restriction;
use crate::store::{Error, Result, SortOrder, Store, TableMark};

pub const ROW_TYPE_LEAF: u32 = 0x01;
pub const ROW_TYPE_EMPTY_CATEGORY: u32 = 0x02;
pub const ROW_TYPE_EXPANDED_CATEGORY: u32 = 0x03;
pub const ROW_TYPE_COLLAPSED_CATEGORY: u32 = 0x04;

#[derive(Clone, Debug)]
pub enum TableKind {
  Content { folder_id: u64, flags: u32 },
  Hierarchy { folder_id: u64, flags: u32 },
  Permission { folder_id: u64, flags: u32 },
  Rule { folder_id: u64 },
  // Synthetic table over a message's attachment bags.
  Attachment { rows: Vec<PropertyBag> },
}

#[derive(Clone, Copy, Debug)]
struct Bookmark {
  index: u32,
  mark: TableMark,
  position: u32,
}

pub struct Table<'a> {
  store: &'a dyn Store,
  dir: String,
  kind: TableKind,
  columns: Option<Vec<PropTag>>,
  sorts: Vec<SortOrder>,
  restriction: Option<Restriction>,
  position: u32,
  table_id: u32,
  // Bookmark indexes grow forever; removal never frees an index for reuse.
  bookmark_index: u32,
  bookmarks: Vec<Bookmark>,
}

impl<'a> Table<'a> {
  pub fn new(store: &'a dyn Store, dir: &str, kind: TableKind) -> Self {
    Self {
      store,
      dir: dir.to_string(),
      kind,
      columns: None,
      sorts: Vec::new(),
      restriction: None,
      position: 0,
      table_id: 0,
      bookmark_index: 0,
      bookmarks: Vec::new(),
    }
  }

  pub fn is_loaded(&self) -> bool {
    matches!(self.kind, TableKind::Attachment { .. }) || self.table_id != 0
  }

  pub fn load(&mut self) -> Result<()> {
    if self.is_loaded() {
      return Ok(());
    }
    let (table_id, _row_count) = match &self.kind {
      TableKind::Content { folder_id, flags } => self.store.load_content_table(
        &self.dir,
        *folder_id,
        *flags,
        self.restriction.as_ref(),
        &self.sorts,
      )?,
      TableKind::Hierarchy { folder_id, flags } => {
        self
          .store
          .load_hierarchy_table(&self.dir, *folder_id, *flags, self.restriction.as_ref())?
      }
      TableKind::Permission { folder_id, flags } => {
        self.store.load_permission_table(&self.dir, *folder_id, *flags)?
      }
      TableKind::Rule { folder_id } => {
        self
          .store
          .load_rule_table(&self.dir, *folder_id, self.restriction.as_ref())?
      }
      TableKind::Attachment { .. } => unreachable!("attachment tables are always loaded"),
    };
    self.table_id = table_id;
    Ok(())
  }

  pub fn unload(&mut self) {
    if self.table_id != 0 {
      if let Err(error) = self.store.unload_table(&self.dir, self.table_id) {
        log::warn!("unloading table {} failed: {error}", self.table_id);
      }
      self.table_id = 0;
    }
  }

  pub fn reset(&mut self) {
    self.columns = None;
    self.sorts.clear();
    self.restriction = None;
    self.position = 0;
    self.unload();
    self.bookmarks.clear();
  }

  pub fn set_columns(&mut self, columns: Option<Vec<PropTag>>) {
    self.columns = columns;
  }

  pub fn set_sorts(&mut self, sorts: Vec<SortOrder>) {
    self.sorts = sorts;
  }

  pub fn set_restriction(&mut self, restriction: Option<Restriction>) {
    self.restriction = restriction;
  }

  pub fn get_position(&self) -> u32 {
    self.position
  }

  pub fn total(&self) -> Result<u32> {
    match &self.kind {
      TableKind::Attachment { rows } => Ok(rows.len() as u32),
      _ => self.store.sum_table(&self.dir, self.table_id),
    }
  }

  // Returns up to `count` rows from the current position and advances by the
  // number actually returned; at either end it returns an empty set.
  pub fn query_rows(&mut self, forward: bool, count: u32) -> Result<Vec<PropertyBag>> {
    let columns = match &self.columns {
      Some(columns) => columns.clone(),
      None => {
        return Err(Error::InvariantViolated(
          "query_rows without columns".to_string(),
        ))
      }
    };
    let total = self.total()?;
    if (self.position == 0 && !forward) || (self.position >= total && forward) {
      return Ok(Vec::new());
    }
    let (start, wanted) = if forward {
      (self.position, count.min(total - self.position))
    } else {
      let start = self.position.saturating_sub(count);
      (start, self.position - start)
    };
    let mut rows = match &self.kind {
      TableKind::Attachment { rows } => rows
        .iter()
        .skip(start as usize)
        .take(wanted as usize)
        .map(|row| project(row, &columns))
        .collect::<Vec<PropertyBag>>(),
      _ => self
        .store
        .query_table(&self.dir, self.table_id, &columns, start, wanted)?,
    };
    if forward {
      self.position += rows.len() as u32;
    } else {
      // Backward reads surface rows nearest-first.
      self.position -= rows.len() as u32;
      rows.reverse();
    }
    Ok(rows)
  }

  pub fn seek_current(&mut self, forward: bool, count: u32) -> Result<u32> {
    let total = self.total()?;
    self.position = if forward {
      (self.position + count).min(total)
    } else {
      self.position.saturating_sub(count)
    };
    Ok(self.position)
  }

  pub fn set_position(&mut self, position: u32) -> Result<()> {
    self.position = position.min(self.total()?);
    Ok(())
  }

  pub fn create_bookmark(&mut self) -> Result<u32> {
    let mark = self.store.mark_table(&self.dir, self.table_id, self.position)?;
    let index = self.bookmark_index;
    self.bookmark_index += 1;
    self.bookmarks.push(Bookmark {
      index,
      mark,
      position: self.position,
    });
    Ok(index)
  }

  // Three outcomes: the exact row exists (true), the row type still matches but
  // the instance moved on (false, position still usable), or the row is gone
  // (false, position restored to the saved one, clamped).
  pub fn retrieve_bookmark(&mut self, index: u32) -> Result<bool> {
    let bookmark = self
      .bookmarks
      .iter()
      .find(|bookmark| bookmark.index == index)
      .copied()
      .ok_or(Error::NotFound)?;
    let located = self.store.locate_table(
      &self.dir,
      self.table_id,
      bookmark.mark.inst_id,
      bookmark.mark.inst_num,
    )?;
    let total = self.total()?;
    let exists = match located {
      Some((position, row_type)) => {
        self.position = position;
        row_type == bookmark.mark.row_type
      }
      None => {
        self.position = bookmark.position;
        false
      }
    };
    self.position = self.position.min(total);
    Ok(exists)
  }

  pub fn remove_bookmark(&mut self, index: u32) {
    self.bookmarks.retain(|bookmark| bookmark.index != index);
  }

  // Category-row operations; the current position is left alone.
  pub fn expand(&mut self, inst_id: u64) -> Result<Option<(u32, u32)>> {
    self.store.expand_table(&self.dir, self.table_id, inst_id)
  }

  pub fn collapse(&mut self, inst_id: u64) -> Result<Option<(u32, u32)>> {
    self.store.collapse_table(&self.dir, self.table_id, inst_id)
  }

  pub fn store_state(&mut self) -> Result<u32> {
    let mark = self.store.mark_table(&self.dir, self.table_id, self.position)?;
    self
      .store
      .store_table_state(&self.dir, self.table_id, mark.inst_id, mark.inst_num)
  }

  // Restores sort, filter and categorisation, puts the position back on the
  // previously-current row (wherever it ended up) and answers a bookmark on
  // the restored state's row. When that row no longer exists the index is
  // reserved but invalid.
  pub fn restore_state(&mut self, state_id: u32) -> Result<u32> {
    let current = self.store.mark_table(&self.dir, self.table_id, self.position)?;
    let restored = self
      .store
      .restore_table_state(&self.dir, self.table_id, state_id)?;
    let relocated = self
      .store
      .locate_table(&self.dir, self.table_id, current.inst_id, current.inst_num)?;
    let new_position = match relocated {
      Some((position, _)) => position,
      None => self.position.min(self.total()?),
    };
    let index = match restored {
      Some(position) => {
        self.position = position;
        self.create_bookmark()?
      }
      None => {
        let index = self.bookmark_index;
        self.bookmark_index += 1;
        index
      }
    };
    self.position = new_position;
    Ok(index)
  }
}

fn project(row: &PropertyBag, columns: &[PropTag]) -> PropertyBag {
  columns
    .iter()
    .filter_map(|&tag| row.get(tag).map(|value| (tag, value.clone())))
    .collect::<Vec<(PropTag, PropValue)>>()
    .into_iter()
    .collect()
}
