// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxorule - extended rules
//
// Extended rules live as hidden associated messages; their condition and action
// payloads are self-describing blobs. Each blob opens with its own named
// property table so a foreign reader can re-resolve named tags, the action blob
// additionally carries a format version that must be 1. All integers are
// little-endian; strings are length-prefixed UTF-8; GUIDs serialise the way
// XIDs do.

use crate::namedprop::{NameKind, PropertyName};
use crate::propval::{self, PropTag, PropValue};
use crate::restriction::{BitmaskRelation, ContentRestriction, MatchMode, Restriction};
use crate::rules::{OP_DELETE, OP_MARK_AS_READ, OP_TAG};
use crate::store::{Error, Result};
use std::str;

pub const EXT_RULE_VERSION: u32 = 1;

const RES_AND: u8 = 0x00;
const RES_OR: u8 = 0x01;
const RES_NOT: u8 = 0x02;
const RES_CONTENT: u8 = 0x03;
const RES_PROPERTY: u8 = 0x04;
const RES_PROPCOMPARE: u8 = 0x05;
const RES_BITMASK: u8 = 0x06;
const RES_SIZE: u8 = 0x07;
const RES_EXIST: u8 = 0x08;
const RES_SUB: u8 = 0x09;
const RES_COMMENT: u8 = 0x0a;
const RES_COUNT: u8 = 0x0b;
const RES_NULL: u8 = 0xff;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NamedPropInfo {
  pub propids: Vec<u16>,
  pub names: Vec<PropertyName>,
}

// The extended subset: everything else is carried opaquely and ignored.
#[derive(Clone, Debug, PartialEq)]
pub enum ExtAction {
  MarkAsRead,
  Delete,
  Tag(PropTag, PropValue),
  Unknown(u8),
}

fn relop_code(relop: propval::RelOp) -> u8 {
  match relop {
    propval::RelOp::Lt => 0,
    propval::RelOp::Le => 1,
    propval::RelOp::Gt => 2,
    propval::RelOp::Ge => 3,
    propval::RelOp::Eq => 4,
    propval::RelOp::Ne => 5,
  }
}

fn decode_action(action_type: u8, body: &[u8]) -> core::result::Result<ExtAction, &'static str> {
  match action_type {
    OP_MARK_AS_READ => Ok(ExtAction::MarkAsRead),
    OP_DELETE => Ok(ExtAction::Delete),
    OP_TAG => {
      let (tag, value) = blob::tagged_value(body).map_err(|_| "tagged value")?;
      Ok(ExtAction::Tag(tag, value))
    }
    // Unknown action types parse but never execute.
    other => Ok(ExtAction::Unknown(other)),
  }
}

peg::parser! {
  grammar blob() for [u8] {
    rule byte() -> u8
      = b:$([_]) { b[0] }
    rule u16_le() -> u16
      = b:$([_][_]) { u16::from_le_bytes([b[0], b[1]]) }
    rule u32_le() -> u32
      = b:$([_]*<4>) { u32::from_le_bytes([b[0], b[1], b[2], b[3]]) }
    rule u64_le() -> u64
      = b:$([_]*<8>) { u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) }
    rule guid() -> uuid::Uuid
      = b:$([_]*<16>) { uuid::Uuid::from_bytes_le(<[u8; 16]>::try_from(b).unwrap()) }
    rule sized() -> &'input [u8]
      = n:u16_le() b:$([_]*<{n as usize}>) { b }
    rule string16() -> String
      = b:sized() {? str::from_utf8(b).map(str::to_string).map_err(|_| "UTF-8") }
    rule tag() -> PropTag
      = t:u32_le() { PropTag(t) }

    rule pred(ok: bool) -> ()
      = {? if ok { Ok(()) } else { Err("predicate") } }

    rule typed_value(ty: u16) -> PropValue
      = pred({ ty == propval::PT_BOOLEAN }) b:byte() { PropValue::Bool(b != 0) }
      / pred({ ty == propval::PT_SHORT }) v:u16_le() { PropValue::Short(v as i16) }
      / pred({ ty == propval::PT_LONG }) v:u32_le() { PropValue::Long(v as i32) }
      / pred({ ty == propval::PT_I8 }) v:u64_le() { PropValue::LongLong(v as i64) }
      / pred({ ty == propval::PT_CURRENCY }) v:u64_le() { PropValue::Currency(v as i64) }
      / pred({ ty == propval::PT_SYSTIME }) v:u64_le() { PropValue::FileTime(v) }
      / pred({ ty == propval::PT_STRING8 }) s:string16() { PropValue::String8(s) }
      / pred({ ty == propval::PT_UNICODE }) s:string16() { PropValue::Unicode(s) }
      / pred({ ty == propval::PT_BINARY }) b:sized() { PropValue::Binary(b.to_vec()) }
      / pred({ ty == propval::PT_CLSID }) g:guid() { PropValue::Clsid(g) }

    pub rule tagged_value() -> (PropTag, PropValue)
      = t:tag() v:typed_value({ t.prop_type() }) { (t, v) }

    rule propname() -> PropertyName
      = [0] set:guid() lid:u32_le() { PropertyName::by_id(set, lid) }
      / [1] set:guid() name:string16() { PropertyName { set, kind: NameKind::Name(name) } }

    pub rule namedprop_info() -> NamedPropInfo
      = n:u16_le() propids:u16_le()*<{n as usize}> names:propname()*<{n as usize}>
      { NamedPropInfo { propids, names } }

    rule relop() -> propval::RelOp
      = [0] { propval::RelOp::Lt }
      / [1] { propval::RelOp::Le }
      / [2] { propval::RelOp::Gt }
      / [3] { propval::RelOp::Ge }
      / [4] { propval::RelOp::Eq }
      / [5] { propval::RelOp::Ne }

    rule match_mode() -> MatchMode
      = [0] { MatchMode::FullString }
      / [1] { MatchMode::Substring }
      / [2] { MatchMode::Prefix }

    pub rule restriction() -> Restriction
      = [0x00] n:u16_le() children:restriction()*<{n as usize}> { Restriction::And(children) }
      / [0x01] n:u16_le() children:restriction()*<{n as usize}> { Restriction::Or(children) }
      / [0x02] child:restriction() { Restriction::Not(Box::new(child)) }
      / [0x03] mode:match_mode() flags:byte() t:tag() value:typed_value({ t.prop_type() })
        {
          Restriction::Content(ContentRestriction {
            mode,
            ignore_case: flags & 0x1 != 0,
            loose: flags & 0x2 != 0,
            tag: t,
            value,
          })
        }
      / [0x04] relop:relop() t:tag() [0] { Restriction::Property { relop, tag: t, value: None } }
      / [0x04] relop:relop() t:tag() [1] value:typed_value({ t.prop_type() })
        { Restriction::Property { relop, tag: t, value: Some(value) } }
      / [0x05] relop:relop() tag1:tag() tag2:tag() { Restriction::PropCompare { relop, tag1, tag2 } }
      / [0x06] [0] t:tag() mask:u32_le()
        { Restriction::Bitmask { relation: BitmaskRelation::EqualToZero, tag: t, mask } }
      / [0x06] [1] t:tag() mask:u32_le()
        { Restriction::Bitmask { relation: BitmaskRelation::NotEqualToZero, tag: t, mask } }
      / [0x07] relop:relop() t:tag() size:u32_le() { Restriction::Size { relop, tag: t, size } }
      / [0x08] t:tag() { Restriction::Exist(t) }
      / [0x09] t:tag() child:restriction()
        { Restriction::Sub { subobject: t, restriction: Box::new(child) } }
      / [0x0a] [0] { Restriction::Comment { restriction: None } }
      / [0x0a] [1] child:restriction() { Restriction::Comment { restriction: Some(Box::new(child)) } }
      / [0x0b] count:u32_le() child:restriction()
        { Restriction::Count { count, restriction: Box::new(child) } }
      / [0xff] { Restriction::Null }

    rule action_body(len: usize) -> ExtAction
      = pred({ len >= 1 }) t:byte() body:$([_]*<{len - 1}>) {? decode_action(t, body) }

    rule action_block() -> ExtAction
      = len:u16_le() action:action_body({ len as usize }) { action }

    pub rule condition() -> (NamedPropInfo, Restriction)
      = names:namedprop_info() res:restriction() { (names, res) }

    pub rule actions() -> (NamedPropInfo, Vec<ExtAction>)
      = names:namedprop_info() version:u32_le() pred({ version == EXT_RULE_VERSION })
        n:u32_le() blocks:action_block()*<{n as usize}>
      { (names, blocks) }
  }
}

pub fn parse_condition(bytes: &[u8]) -> Result<(NamedPropInfo, Restriction)> {
  blob::condition(bytes).map_err(|error| Error::Parse(format!("extended-rule condition: {error}")))
}

// The version gate sits inside the grammar: anything but version 1 parses as an
// error and the caller drops the rule.
pub fn parse_actions(bytes: &[u8]) -> Result<(NamedPropInfo, Vec<ExtAction>)> {
  blob::actions(bytes).map_err(|error| Error::Parse(format!("extended-rule actions: {error}")))
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
  out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
  out.extend_from_slice(&value.to_le_bytes());
}

fn push_sized(out: &mut Vec<u8>, bytes: &[u8]) {
  push_u16(out, bytes.len() as u16);
  out.extend_from_slice(bytes);
}

fn encode_typed_value(out: &mut Vec<u8>, value: &PropValue) -> Result<()> {
  match value {
    PropValue::Bool(b) => out.push(u8::from(*b)),
    PropValue::Short(v) => push_u16(out, *v as u16),
    PropValue::Long(v) => push_u32(out, *v as u32),
    PropValue::LongLong(v) => out.extend_from_slice(&(*v as u64).to_le_bytes()),
    PropValue::Currency(v) => out.extend_from_slice(&(*v as u64).to_le_bytes()),
    PropValue::FileTime(v) => out.extend_from_slice(&v.to_le_bytes()),
    PropValue::String8(s) | PropValue::Unicode(s) => push_sized(out, s.as_bytes()),
    PropValue::Binary(b) => push_sized(out, b),
    PropValue::Clsid(g) => out.extend_from_slice(&g.to_bytes_le()),
    other => {
      return Err(Error::Parse(format!(
        "value type {:#x} cannot appear in an extended rule",
        other.prop_type()
      )))
    }
  }
  Ok(())
}

fn encode_namedprop_info(out: &mut Vec<u8>, info: &NamedPropInfo) {
  push_u16(out, info.propids.len() as u16);
  for propid in &info.propids {
    push_u16(out, *propid);
  }
  for name in &info.names {
    match &name.kind {
      NameKind::Id(lid) => {
        out.push(0);
        out.extend_from_slice(&name.set.to_bytes_le());
        push_u32(out, *lid);
      }
      NameKind::Name(string) => {
        out.push(1);
        out.extend_from_slice(&name.set.to_bytes_le());
        push_sized(out, string.as_bytes());
      }
    }
  }
}

pub fn encode_restriction(out: &mut Vec<u8>, restriction: &Restriction) -> Result<()> {
  match restriction {
    Restriction::And(children) | Restriction::Or(children) => {
      out.push(if matches!(restriction, Restriction::And(_)) { RES_AND } else { RES_OR });
      push_u16(out, children.len() as u16);
      for child in children {
        encode_restriction(out, child)?;
      }
    }
    Restriction::Not(child) => {
      out.push(RES_NOT);
      encode_restriction(out, child)?;
    }
    Restriction::Content(content) => {
      out.push(RES_CONTENT);
      out.push(match content.mode {
        MatchMode::FullString => 0,
        MatchMode::Substring => 1,
        MatchMode::Prefix => 2,
      });
      out.push(u8::from(content.ignore_case) | u8::from(content.loose) << 1);
      push_u32(out, content.tag.0);
      encode_typed_value(out, &content.value)?;
    }
    Restriction::Property { relop, tag, value } => {
      out.push(RES_PROPERTY);
      out.push(relop_code(*relop));
      push_u32(out, tag.0);
      match value {
        None => out.push(0),
        Some(value) => {
          out.push(1);
          encode_typed_value(out, value)?;
        }
      }
    }
    Restriction::PropCompare { relop, tag1, tag2 } => {
      out.push(RES_PROPCOMPARE);
      out.push(relop_code(*relop));
      push_u32(out, tag1.0);
      push_u32(out, tag2.0);
    }
    Restriction::Bitmask { relation, tag, mask } => {
      out.push(RES_BITMASK);
      out.push(match relation {
        BitmaskRelation::EqualToZero => 0,
        BitmaskRelation::NotEqualToZero => 1,
      });
      push_u32(out, tag.0);
      push_u32(out, *mask);
    }
    Restriction::Size { relop, tag, size } => {
      out.push(RES_SIZE);
      out.push(relop_code(*relop));
      push_u32(out, tag.0);
      push_u32(out, *size);
    }
    Restriction::Exist(tag) => {
      out.push(RES_EXIST);
      push_u32(out, tag.0);
    }
    Restriction::Sub { subobject, restriction } => {
      out.push(RES_SUB);
      push_u32(out, subobject.0);
      encode_restriction(out, restriction)?;
    }
    Restriction::Comment { restriction } => {
      out.push(RES_COMMENT);
      match restriction {
        None => out.push(0),
        Some(inner) => {
          out.push(1);
          encode_restriction(out, inner)?;
        }
      }
    }
    Restriction::Count { count, restriction } => {
      out.push(RES_COUNT);
      push_u32(out, *count);
      encode_restriction(out, restriction)?;
    }
    Restriction::Null => out.push(RES_NULL),
  }
  Ok(())
}

pub fn encode_condition(info: &NamedPropInfo, restriction: &Restriction) -> Result<Vec<u8>> {
  let mut out = Vec::new();
  encode_namedprop_info(&mut out, info);
  encode_restriction(&mut out, restriction)?;
  Ok(out)
}

pub fn encode_actions(info: &NamedPropInfo, actions: &[ExtAction]) -> Result<Vec<u8>> {
  encode_actions_versioned(info, actions, EXT_RULE_VERSION)
}

pub fn encode_actions_versioned(info: &NamedPropInfo, actions: &[ExtAction], version: u32) -> Result<Vec<u8>> {
  let mut out = Vec::new();
  encode_namedprop_info(&mut out, info);
  push_u32(&mut out, version);
  push_u32(&mut out, actions.len() as u32);
  for action in actions {
    let mut body = Vec::new();
    match action {
      ExtAction::MarkAsRead => body.push(OP_MARK_AS_READ),
      ExtAction::Delete => body.push(OP_DELETE),
      ExtAction::Tag(tag, value) => {
        body.push(OP_TAG);
        push_u32(&mut body, tag.0);
        encode_typed_value(&mut body, value)?;
      }
      ExtAction::Unknown(action_type) => body.push(*action_type),
    }
    push_u16(&mut out, body.len() as u16);
    out.extend_from_slice(&body);
  }
  Ok(out)
}
