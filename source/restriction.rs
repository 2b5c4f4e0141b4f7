// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxcdata - restrictions
//
// Restrictions are immutable trees owned by their root; evaluation borrows the
// tree and the message without mutating either. The one stateful node, COUNT,
// keeps its running counter in an evaluator-local map keyed by node identity so
// that no state leaks between evaluations.

use crate::propval::{MessageContent, PropTag, PropValue, PropertyBag, RelOp, PR_MESSAGE_ATTACHMENTS, PR_MESSAGE_RECIPIENTS};
use std::collections;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchMode {
  FullString,
  Substring,
  Prefix,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitmaskRelation {
  EqualToZero,
  NotEqualToZero,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContentRestriction {
  pub mode: MatchMode,
  pub ignore_case: bool,
  // Collapses whitespace runs before the (case-folded) comparison.
  pub loose: bool,
  pub tag: PropTag,
  pub value: PropValue,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Restriction {
  And(Vec<Restriction>),
  Or(Vec<Restriction>),
  Not(Box<Restriction>),
  Content(ContentRestriction),
  // A None literal stands for NULL: a missing property EQ NULL is true.
  Property {
    relop: RelOp,
    tag: PropTag,
    value: Option<PropValue>,
  },
  PropCompare {
    relop: RelOp,
    tag1: PropTag,
    tag2: PropTag,
  },
  Bitmask {
    relation: BitmaskRelation,
    tag: PropTag,
    mask: u32,
  },
  Size {
    relop: RelOp,
    tag: PropTag,
    size: u32,
  },
  Exist(PropTag),
  // Applies the inner restriction over PR_MESSAGE_RECIPIENTS or
  // PR_MESSAGE_ATTACHMENTS elements.
  Sub {
    subobject: PropTag,
    restriction: Box<Restriction>,
  },
  Comment {
    restriction: Option<Box<Restriction>>,
  },
  // True at most `count` times across an evaluation. Inside SUBRESTRICTION it
  // instead compares the number of matching elements for exact equality.
  Count {
    count: u32,
    restriction: Box<Restriction>,
  },
  Null,
}

impl Restriction {
  // Rewrites every referenced tag; used to re-home named ids carried by
  // extended-rule blobs.
  pub fn map_tags(&mut self, f: &mut impl FnMut(PropTag) -> PropTag) {
    match self {
      Self::And(children) | Self::Or(children) => {
        for child in children {
          child.map_tags(f);
        }
      }
      Self::Not(child) => child.map_tags(f),
      Self::Content(content) => content.tag = f(content.tag),
      Self::Property { tag, .. } | Self::Bitmask { tag, .. } | Self::Size { tag, .. } | Self::Exist(tag) => {
        *tag = f(*tag)
      }
      Self::PropCompare { tag1, tag2, .. } => {
        *tag1 = f(*tag1);
        *tag2 = f(*tag2);
      }
      Self::Sub { restriction, .. } => restriction.map_tags(f),
      Self::Comment { restriction } => {
        if let Some(inner) = restriction {
          inner.map_tags(f);
        }
      }
      Self::Count { restriction, .. } => restriction.map_tags(f),
      Self::Null => (),
    }
  }
}

pub fn eval_message(restriction: &Restriction, message: &MessageContent) -> bool {
  Evaluator::default().eval_props(Some(message), &message.properties, restriction)
}

pub fn eval_bag(restriction: &Restriction, bag: &PropertyBag) -> bool {
  Evaluator::default().eval_props(None, bag, restriction)
}

#[derive(Default)]
struct Evaluator {
  // Remaining COUNT budget per node, keyed by node address.
  counts: collections::HashMap<usize, u32>,
}

impl Evaluator {
  fn eval_props(&mut self, message: Option<&MessageContent>, bag: &PropertyBag, restriction: &Restriction) -> bool {
    match restriction {
      Restriction::And(children) => children.iter().all(|child| self.eval_props(message, bag, child)),
      Restriction::Or(children) => children.iter().any(|child| self.eval_props(message, bag, child)),
      Restriction::Not(child) => !self.eval_props(message, bag, child),
      Restriction::Content(content) => eval_content(content, bag),
      Restriction::Property { relop, tag, value } => match (bag.get(*tag), value) {
        (Some(actual), Some(literal)) => actual.compare(*relop, literal),
        (None, None) => *relop == RelOp::Eq,
        (Some(_), None) => *relop == RelOp::Ne,
        (None, Some(_)) => false,
      },
      Restriction::PropCompare { relop, tag1, tag2 } => match (bag.get(*tag1), bag.get(*tag2)) {
        (Some(lhs), Some(rhs)) => lhs.compare(*relop, rhs),
        _ => false,
      },
      Restriction::Bitmask { relation, tag, mask } => match bag.get_long(*tag) {
        Some(value) => {
          let masked = value as u32 & mask;
          match relation {
            BitmaskRelation::EqualToZero => masked == 0,
            BitmaskRelation::NotEqualToZero => masked != 0,
          }
        }
        None => false,
      },
      Restriction::Size { relop, tag, size } => match bag.get(*tag) {
        Some(value) => relop.matches(value.size().cmp(size)),
        None => false,
      },
      Restriction::Exist(tag) => bag.has(*tag),
      Restriction::Sub { subobject, restriction } => {
        if *subobject != PR_MESSAGE_RECIPIENTS && *subobject != PR_MESSAGE_ATTACHMENTS {
          return false;
        }
        self.eval_sub(message, *subobject, restriction)
      }
      Restriction::Comment { restriction } => match restriction {
        Some(inner) => self.eval_props(message, bag, inner),
        None => true,
      },
      Restriction::Count { count, restriction: inner } => {
        let key = restriction as *const Restriction as usize;
        let remaining = *self.counts.entry(key).or_insert(*count);
        if remaining == 0 {
          return false;
        }
        if !self.eval_props(message, bag, inner) {
          return false;
        }
        self.counts.insert(key, remaining - 1);
        true
      }
      Restriction::Null => true,
    }
  }

  // Boolean structure above the per-element leaves distributes over the element
  // set: AND(a, b) holds when some element matches a and some element matches b.
  fn eval_sub(&mut self, message: Option<&MessageContent>, subobject: PropTag, restriction: &Restriction) -> bool {
    match restriction {
      Restriction::Or(children) => children.iter().any(|child| self.eval_sub(message, subobject, child)),
      Restriction::And(children) => children.iter().all(|child| self.eval_sub(message, subobject, child)),
      Restriction::Not(child) => !self.eval_sub(message, subobject, child),
      _ => self.eval_elements(message, subobject, restriction),
    }
  }

  fn eval_elements(&mut self, message: Option<&MessageContent>, subobject: PropTag, restriction: &Restriction) -> bool {
    let mut elements: Vec<&PropertyBag> = Vec::new();
    if let Some(message) = message {
      if subobject == PR_MESSAGE_RECIPIENTS {
        elements.extend(message.recipients.iter());
      } else {
        elements.extend(message.attachments.iter().map(|attachment| &attachment.properties));
      }
    }
    // A COUNT right under SUBRESTRICTION counts matching elements and compares
    // for exact equality with its budget, not at-least.
    if let Restriction::Count { count, restriction: inner } = restriction {
      let matched = elements
        .iter()
        .filter(|bag| self.eval_props(None, bag, inner))
        .count();
      return matched as u32 == *count;
    }
    elements.iter().any(|bag| self.eval_props(None, bag, restriction))
  }
}

fn eval_content(content: &ContentRestriction, bag: &PropertyBag) -> bool {
  let actual = match bag.get_str(content.tag) {
    Some(actual) => actual,
    None => return false,
  };
  let literal = match &content.value {
    PropValue::String8(literal) | PropValue::Unicode(literal) => literal.as_str(),
    _ => return false,
  };
  let (actual, literal) = if content.loose {
    (collapse(actual), collapse(literal))
  } else {
    (actual.to_string(), literal.to_string())
  };
  let (actual, literal) = if content.ignore_case || content.loose {
    (actual.to_ascii_lowercase(), literal.to_ascii_lowercase())
  } else {
    (actual, literal)
  };
  match content.mode {
    MatchMode::FullString => actual == literal,
    MatchMode::Substring => actual.contains(&literal),
    MatchMode::Prefix => actual.starts_with(&literal),
  }
}

fn collapse(s: &str) -> String {
  s.split_whitespace().collect::<Vec<&str>>().join(" ")
}
