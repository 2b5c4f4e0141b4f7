// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxocal - meeting responses
//
// Resource mailboxes (rooms, equipment) answer meeting requests on their own
// according to the mailbox booking policy. This component only records the
// intended response on the stored item; the meeting-request machinery
// downstream produces the actual reply message.

use crate::namedprop::{self, PropertyName};
use crate::propval::{
  self, MessageContent, PropTag, PropValue, DT_EQUIPMENT, DT_ROOM, PR_DISPLAY_TYPE, PR_END_DATE,
  PR_MESSAGE_CLASS, PR_START_DATE,
};
use crate::rop;
use crate::store::{Result, Store};

pub const POLICY_PROCESS_MEETING_REQUESTS: u32 = 0x0001;
pub const POLICY_DECLINE_RECURRING_MEETING_REQUESTS: u32 = 0x0002;
pub const POLICY_DECLINE_CONFLICTING_MEETING_REQUESTS: u32 = 0x0004;

pub const RESPONSE_ACCEPTED: i32 = 3;
pub const RESPONSE_DECLINED: i32 = 4;
pub const BUSY_STATUS_BUSY: i32 = 2;

const CLASS_MEETING_REQUEST: &str = "IPM.Schedule.Meeting.Request";
const CLASS_RESPONSE_POSITIVE: &str = "IPM.Schedule.Meeting.Resp.Pos";
const CLASS_RESPONSE_NEGATIVE: &str = "IPM.Schedule.Meeting.Resp.Neg";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
  Accepted,
  Declined,
  Untouched,
}

// Booking only ever triggers for meeting requests addressed to at least one
// room or equipment recipient.
pub fn is_resource_request(content: &MessageContent) -> bool {
  if content.properties.get_str(PR_MESSAGE_CLASS) != Some(CLASS_MEETING_REQUEST) {
    return false;
  }
  content.recipients.iter().any(|recipient| {
    matches!(
      recipient.get_long(PR_DISPLAY_TYPE),
      Some(DT_ROOM) | Some(DT_EQUIPMENT)
    )
  })
}

// The three policy bits come from the mailbox's store properties.
pub fn policy(store: &dyn Store, dir: &str) -> Result<u32> {
  let tags = [
    propval::PR_SCHDINFO_AUTO_ACCEPT_APPTS,
    propval::PR_SCHDINFO_DISALLOW_RECURRING_APPTS,
    propval::PR_SCHDINFO_DISALLOW_OVERLAPPING_APPTS,
  ];
  let props = store.get_store_properties(dir, &tags)?;
  let mut policy = 0;
  if props.get_bool(propval::PR_SCHDINFO_AUTO_ACCEPT_APPTS).unwrap_or(false) {
    policy |= POLICY_PROCESS_MEETING_REQUESTS;
  }
  if props.get_bool(propval::PR_SCHDINFO_DISALLOW_RECURRING_APPTS).unwrap_or(false) {
    policy |= POLICY_DECLINE_RECURRING_MEETING_REQUESTS;
  }
  if props.get_bool(propval::PR_SCHDINFO_DISALLOW_OVERLAPPING_APPTS).unwrap_or(false) {
    policy |= POLICY_DECLINE_CONFLICTING_MEETING_REQUESTS;
  }
  Ok(policy)
}

// First matching row of the decision table wins:
//   recurring  + DECLINE_RECURRING            -> declined
//   overlap>=1 + DECLINE_CONFLICTING          -> declined
//   overlap==0 + PROCESS enabled              -> accepted
//   PROCESS disabled                          -> untouched
fn decide(policy: u32, recurring: bool, overlap: u32) -> Outcome {
  if recurring && policy & POLICY_DECLINE_RECURRING_MEETING_REQUESTS != 0 {
    return Outcome::Declined;
  }
  if overlap >= 1 && policy & POLICY_DECLINE_CONFLICTING_MEETING_REQUESTS != 0 {
    return Outcome::Declined;
  }
  if policy & POLICY_PROCESS_MEETING_REQUESTS != 0 && overlap == 0 {
    return Outcome::Accepted;
  }
  Outcome::Untouched
}

// Decides and records the response on the stored item: message class, response
// status, busy status (accept only), plus a fresh change number and PCL entry.
pub fn process(
  store: &dyn Store,
  dir: &str,
  message_id: u64,
  content: &mut MessageContent,
  policy: u32,
) -> Result<Outcome> {
  let names = [
    PropertyName::by_id(namedprop::PSETID_APPOINTMENT, namedprop::PIDLID_RECURRING),
    PropertyName::by_id(namedprop::PSETID_APPOINTMENT, namedprop::PIDLID_RESPONSE_STATUS),
    PropertyName::by_id(namedprop::PSETID_APPOINTMENT, namedprop::PIDLID_BUSY_STATUS),
  ];
  let propids = store.get_named_propids(dir, true, &names)?;
  let recurring_tag = PropTag::new(propids[0], propval::PT_BOOLEAN);
  let response_tag = PropTag::new(propids[1], propval::PT_LONG);
  let busy_tag = PropTag::new(propids[2], propval::PT_LONG);

  let recurring = content.properties.get_bool(recurring_tag).unwrap_or(false);
  let overlap = match (
    content.properties.get_systime(PR_START_DATE),
    content.properties.get_systime(PR_END_DATE),
  ) {
    (Some(start), Some(end)) => store.appt_meetreq_overlap(dir, start, end)?,
    _ => 0,
  };

  let outcome = decide(policy, recurring, overlap);
  match outcome {
    Outcome::Accepted => {
      content
        .properties
        .set(PR_MESSAGE_CLASS, PropValue::Unicode(CLASS_RESPONSE_POSITIVE.to_string()));
      content.properties.set(response_tag, PropValue::Long(RESPONSE_ACCEPTED));
      content.properties.set(busy_tag, PropValue::Long(BUSY_STATUS_BUSY));
    }
    Outcome::Declined => {
      content
        .properties
        .set(PR_MESSAGE_CLASS, PropValue::Unicode(CLASS_RESPONSE_NEGATIVE.to_string()));
      content.properties.set(response_tag, PropValue::Long(RESPONSE_DECLINED));
    }
    Outcome::Untouched => return Ok(outcome),
  }

  let cn = store.allocate_cn(dir)?;
  let xid = crate::rules::store_xid(store, dir, cn)?;
  let mut pcl = match content.properties.get_bytes(propval::PR_PREDECESSOR_CHANGE_LIST) {
    Some(bytes) => rop::Pcl::from_bytes(bytes)?,
    None => rop::Pcl::new(),
  };
  pcl.append(xid);
  let now = rop::current_nttime();
  let mut update = crate::propval::PropertyBag::new();
  update.set(propval::PID_TAG_CHANGE_NUMBER, PropValue::LongLong(cn as i64));
  update.set(propval::PR_CHANGE_KEY, PropValue::Binary(xid.to_bytes().to_vec()));
  update.set(
    propval::PR_PREDECESSOR_CHANGE_LIST,
    PropValue::Binary(pcl.serialize()),
  );
  update.set(propval::PR_LOCAL_COMMIT_TIME, PropValue::FileTime(now));
  update.set(propval::PR_LAST_MODIFICATION_TIME, PropValue::FileTime(now));
  update.set(PR_MESSAGE_CLASS, content.properties.get(PR_MESSAGE_CLASS).unwrap().clone());
  if let Some(response) = content.properties.get(response_tag) {
    update.set(response_tag, response.clone());
  }
  if let Some(busy) = content.properties.get(busy_tag) {
    update.set(busy_tag, busy.clone());
  }
  for (tag, value) in update.iter() {
    content.properties.set(tag, value.clone());
  }
  store.set_message_properties(dir, message_id, &update)?;
  Ok(outcome)
}
