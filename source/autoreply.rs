// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxoof - OOF behaviour
//
// Auto-replies are driven entirely by per-mailbox files: config/autoreply.cfg
// holds the OOF switches, config/internal-reply and config/external-reply hold
// the reply templates (RFC-5322 headers, blank line, body). The reply leaves
// through the outbound queue as auto-reply@<mailbox-domain> → original sender.

use crate::abtree::Directory;
use crate::store::{MailQueue, Result, Store};
use base64::Engine as _;
use std::{collections, fs, path, sync, time};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OofConfig {
  // 0 = off, 1 = on, 2 = on within [start_time, end_time].
  pub state: u8,
  pub start_time: Option<i64>,
  pub end_time: Option<i64>,
  pub allow_external: bool,
  // When set, external replies additionally require the sender to be one of
  // the user's contacts.
  pub external_audience: bool,
}

impl OofConfig {
  pub fn parse(contents: &str) -> Self {
    let mut config = Self::default();
    for line in contents.lines() {
      let (key, value) = match line.split_once('=') {
        Some((key, value)) => (key.trim(), value.trim()),
        None => continue,
      };
      match key {
        "OOF_STATE" => config.state = value.parse().unwrap_or(0),
        "START_TIME" => config.start_time = value.parse().ok(),
        "END_TIME" => config.end_time = value.parse().ok(),
        "ALLOW_EXTERNAL_OOF" => config.allow_external = value.parse::<i64>().map(|v| v != 0).unwrap_or(false),
        "EXTERNAL_AUDIENCE" => config.external_audience = value.parse::<i64>().map(|v| v != 0).unwrap_or(false),
        _ => (),
      }
    }
    config
  }

  fn active_at(&self, now: i64) -> bool {
    match self.state {
      1 => true,
      2 => {
        self.start_time.map_or(true, |start| start <= now)
          && self.end_time.map_or(true, |end| now <= end)
      }
      _ => false,
    }
  }
}

// Rate limiter for outbound auto-replies: one reply per (from, to) pair per
// audit interval. Oldest entries are evicted first once the table is full.
pub struct BounceAudit {
  capacity: usize,
  interval: time::Duration,
  entries: sync::Mutex<collections::HashMap<String, time::Instant>>,
}

impl BounceAudit {
  pub fn new(capacity: usize, interval: time::Duration) -> Self {
    Self {
      capacity,
      interval,
      entries: sync::Mutex::new(collections::HashMap::new()),
    }
  }

  // True when the pair may be replied to now; the attempt is recorded.
  pub fn check(&self, from: &str, rcpt: &str) -> bool {
    let key = format!("{}:{}", from.to_ascii_lowercase(), rcpt.to_ascii_lowercase());
    let mut entries = self.entries.lock().unwrap();
    if let Some(last) = entries.get(&key) {
      if last.elapsed() < self.interval {
        return false;
      }
    }
    if entries.len() >= self.capacity && !entries.contains_key(&key) {
      if let Some(oldest) = entries
        .iter()
        .min_by_key(|(_, instant)| **instant)
        .map(|(key, _)| key.clone())
      {
        entries.remove(&oldest);
      }
    }
    entries.insert(key, time::Instant::now());
    true
  }
}

#[derive(Debug, PartialEq)]
pub(crate) struct Template {
  pub content_type: String,
  pub charset: Option<String>,
  pub subject: String,
  pub body: Vec<u8>,
}

// Templates are stored with whatever line endings the admin saved; normalise to
// CRLF before splitting headers from body.
pub(crate) fn parse_template(raw: &[u8]) -> Option<Template> {
  let mut normalized = Vec::with_capacity(raw.len() + 16);
  for (i, &byte) in raw.iter().enumerate() {
    if byte == b'\n' && (i == 0 || raw[i - 1] != b'\r') {
      normalized.push(b'\r');
    }
    normalized.push(byte);
  }
  let split = memchr::memmem::find(&normalized, b"\r\n\r\n")?;
  let headers = String::from_utf8_lossy(&normalized[..split]).into_owned();
  let body = normalized[split + 4..].to_vec();
  let mut template = Template {
    content_type: "text/plain".to_string(),
    charset: None,
    subject: "auto response message".to_string(),
    body,
  };
  for line in headers.split("\r\n") {
    let (name, value) = match line.split_once(':') {
      Some((name, value)) => (name.trim(), value.trim()),
      None => continue,
    };
    if name.eq_ignore_ascii_case("Subject") {
      template.subject = value.to_string();
    } else if name.eq_ignore_ascii_case("Content-Type") {
      let (content_type, params) = match value.split_once(';') {
        Some((content_type, params)) => (content_type, params),
        None => (value, ""),
      };
      template.content_type = content_type.trim().to_string();
      let folded = params.to_ascii_lowercase();
      if let Some(at) = folded.find("charset=") {
        let charset = &params[at + 8..];
        let charset = charset.split(';').next().unwrap_or("").trim().trim_matches('"');
        if !charset.is_empty() {
          template.charset = Some(charset.to_string());
        }
      }
    }
  }
  Some(template)
}

// Internal when both addresses share a domain, or when both domains are local
// to the same organisation. Everything else is external.
pub(crate) fn is_internal(directory: &dyn Directory, to_domain: &str, from_domain: &str) -> bool {
  if to_domain.eq_ignore_ascii_case(from_domain) {
    return true;
  }
  directory.check_domain(to_domain) && directory.check_same_org(to_domain, from_domain)
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTH_NAMES: [&str; 12] = [
  "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

// RFC 2822 date in UTC; days-to-civil per Hinnant.
pub(crate) fn rfc2822_date(unix: i64) -> String {
  let days = unix.div_euclid(86_400);
  let secs = unix.rem_euclid(86_400);
  let weekday = (days + 4).rem_euclid(7) as usize;
  let z = days + 719_468;
  let era = z.div_euclid(146_097);
  let doe = z - era * 146_097;
  let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
  let year = yoe + era * 400;
  let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
  let mp = (5 * doy + 2) / 153;
  let day = doy - (153 * mp + 2) / 5 + 1;
  let month = if mp < 10 { mp + 3 } else { mp - 9 };
  let year = if month <= 2 { year + 1 } else { year };
  format!(
    "{}, {:02} {} {} {:02}:{:02}:{:02} +0000",
    DAY_NAMES[weekday],
    day,
    MONTH_NAMES[(month - 1) as usize],
    year,
    secs / 3600,
    secs % 3600 / 60,
    secs % 60,
  )
}

fn wrap_base64(encoded: &str) -> String {
  encoded
    .as_bytes()
    .chunks(76)
    .map(|chunk| std::str::from_utf8(chunk).unwrap())
    .collect::<Vec<&str>>()
    .join("\r\n")
}

fn now_unix() -> i64 {
  time::SystemTime::now()
    .duration_since(time::UNIX_EPOCH)
    .unwrap_or(time::Duration::ZERO)
    .as_secs() as i64
}

// Runs the full guard chain and, when every guard passes, enqueues the reply.
// Answers whether a reply left the building.
pub fn respond(
  store: &dyn Store,
  directory: &dyn Directory,
  queue: &dyn MailQueue,
  audit: &BounceAudit,
  mailbox_dir: &str,
  envelope_from: &str,
  envelope_to: &str,
) -> Result<bool> {
  if envelope_from.eq_ignore_ascii_case(envelope_to) || envelope_from.eq_ignore_ascii_case("none@none") {
    return Ok(false);
  }
  let (from_domain, to_domain) = match (
    envelope_from.split_once('@').map(|(_, domain)| domain),
    envelope_to.split_once('@').map(|(_, domain)| domain),
  ) {
    (Some(from_domain), Some(to_domain)) => (from_domain, to_domain),
    _ => return Ok(false),
  };
  let config = match fs::read_to_string(path::Path::new(mailbox_dir).join("config/autoreply.cfg")) {
    Ok(contents) => OofConfig::parse(&contents),
    Err(_) => return Ok(false),
  };
  if !config.active_at(now_unix()) {
    return Ok(false);
  }
  let template_name = if is_internal(directory, to_domain, from_domain) {
    "internal-reply"
  } else {
    if !config.allow_external {
      return Ok(false);
    }
    if config.external_audience && !store.check_contact_address(mailbox_dir, envelope_from)? {
      return Ok(false);
    }
    "external-reply"
  };
  if !audit.check(envelope_from, envelope_to) {
    log::debug!("auto-reply to {envelope_from} suppressed by the bounce audit");
    return Ok(false);
  }
  let raw = match fs::read(path::Path::new(mailbox_dir).join("config").join(template_name)) {
    Ok(raw) => raw,
    Err(_) => return Ok(false),
  };
  let template = match parse_template(&raw) {
    Some(template) => template,
    None => return Ok(false),
  };
  let mut content_type = template.content_type.clone();
  if let Some(charset) = &template.charset {
    content_type = format!("{content_type}; charset=\"{charset}\"");
  }
  let encoded = wrap_base64(&base64::engine::general_purpose::STANDARD.encode(&template.body));
  let mail = format!(
    "Received: from unknown (helo localhost) (unknown@127.0.0.1)\r\n\
     \tby herculiz with SMTP\r\n\
     From: {envelope_to}\r\n\
     To: {envelope_from}\r\n\
     MIME-Version: 1.0\r\n\
     X-Auto-Response-Suppress: All\r\n\
     Date: {}\r\n\
     Subject: {}\r\n\
     Content-Type: {content_type}\r\n\
     Content-Transfer-Encoding: base64\r\n\
     \r\n\
     {encoded}\r\n",
    rfc2822_date(now_unix()),
    template.subject,
  );
  queue.enqueue(
    &format!("auto-reply@{to_domain}"),
    envelope_from,
    mail.as_bytes(),
  )?;
  Ok(true)
}
