// Feeds a directory tree of RFC-5322 files into the archive index service. Per
// mail, the service receives one line:
//   A-INST <base64(envelope)> {"file":"",<digest>}\r\n
// where the envelope is From plus every To/Cc/Bcc address as zero-terminated
// strings, and answers TRUE <mail-id> <subdir>\r\n. Accepted bodies are then
// filed under <archive-root>/<subdir>/<mail-id>.

use anyhow::Context as _;
use base64::Engine as _;
use std::{
  fs,
  io::{self, Read as _, Write as _},
  net::{self, ToSocketAddrs as _},
  num, path, sync, time,
};

pub(crate) fn unfolded_headers(raw: &[u8]) -> Vec<(String, String)> {
  let end = memchr::memmem::find(raw, b"\r\n\r\n")
    .or_else(|| memchr::memmem::find(raw, b"\n\n"))
    .unwrap_or(raw.len());
  let text = String::from_utf8_lossy(&raw[..end]);
  let mut headers: Vec<(String, String)> = Vec::new();
  for line in text.lines() {
    if line.starts_with(' ') || line.starts_with('\t') {
      if let Some((_, value)) = headers.last_mut() {
        value.push(' ');
        value.push_str(line.trim());
      }
      continue;
    }
    if let Some((name, value)) = line.split_once(':') {
      headers.push((name.trim().to_string(), value.trim().to_string()));
    }
  }
  headers
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, value)| value.as_str())
}

// Pulls bare addresses out of an address-list header value.
pub(crate) fn extract_addresses(value: &str) -> Vec<String> {
  let mut addresses = Vec::new();
  for token in value.split([',', ';']) {
    let token = token.trim();
    let address = match (token.find('<'), token.find('>')) {
      (Some(open), Some(close)) if open < close => &token[open + 1..close],
      _ => token,
    };
    let address = address.trim();
    match address.split_once('@') {
      Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
        addresses.push(address.to_string())
      }
      _ => (),
    }
  }
  addresses
}

// From plus all To/Cc/Bcc, zero-terminated concatenation, then base64.
pub(crate) fn envelope_digest(from: &str, recipients: &[String]) -> String {
  let mut envelope = Vec::new();
  envelope.extend_from_slice(from.as_bytes());
  envelope.push(0);
  for recipient in recipients {
    envelope.extend_from_slice(recipient.as_bytes());
    envelope.push(0);
  }
  envelope.push(0);
  base64::engine::general_purpose::STANDARD.encode(envelope)
}

fn json_escape(s: &str) -> String {
  let mut escaped = String::with_capacity(s.len());
  for c in s.chars() {
    match c {
      '"' => escaped.push_str("\\\""),
      '\\' => escaped.push_str("\\\\"),
      c if (c as u32) < 0x20 => escaped.push_str(&format!("\\u{:04x}", c as u32)),
      c => escaped.push(c),
    }
  }
  escaped
}

pub(crate) fn parse_response(line: &str) -> Option<(i64, String)> {
  let rest = line.strip_prefix("TRUE ").or_else(|| line.strip_prefix("true "))?;
  let (mail_id, subdir) = rest.split_once(' ')?;
  Some((mail_id.parse().ok()?, subdir.to_string()))
}

fn connect(address: &str, port: u16, timeout: Option<time::Duration>) -> anyhow::Result<net::TcpStream> {
  let resolved = (address, port)
    .to_socket_addrs()?
    .next()
    .with_context(|| format!("couldn't resolve {address}:{port}"))?;
  let mut stream = match timeout {
    Some(duration) => {
      let stream = net::TcpStream::connect_timeout(&resolved, duration)?;
      stream.set_read_timeout(Some(duration))?;
      stream
    }
    None => net::TcpStream::connect(resolved)?,
  };
  // The service greets first.
  let mut greeting = [0; 32];
  let read = stream.read(&mut greeting)?;
  anyhow::ensure!(
    &greeting[..read] == b"OK\r\n",
    "unexpected greeting {:?}",
    &greeting[..read]
  );
  Ok(stream)
}

fn submit_one(
  address: &str,
  port: u16,
  timeout: Option<time::Duration>,
  raw: &[u8],
) -> anyhow::Result<(i64, String)> {
  let headers = unfolded_headers(raw);
  let from = header(&headers, "From")
    .map(extract_addresses)
    .and_then(|addresses| addresses.into_iter().next())
    .unwrap_or_else(|| "none@none".to_string());
  let mut recipients = Vec::new();
  for name in ["To", "Cc", "Bcc"] {
    if let Some(value) = header(&headers, name) {
      recipients.append(&mut extract_addresses(value));
    }
  }
  let digest = format!(
    "\"from\":\"{}\",\"subject\":\"{}\",\"size\":{}",
    json_escape(&from),
    json_escape(header(&headers, "Subject").unwrap_or("")),
    raw.len(),
  );
  let line = format!(
    "A-INST {} {{\"file\":\"\",{digest}}}\r\n",
    envelope_digest(&from, &recipients),
  );
  let mut stream = connect(address, port, timeout)?;
  stream.write_all(line.as_bytes())?;
  let mut response = Vec::new();
  let mut buffer = [0; 1024];
  loop {
    let read = stream.read(&mut buffer)?;
    anyhow::ensure!(read > 0, "index service closed the connection");
    response.extend_from_slice(&buffer[..read]);
    if response.ends_with(b"\r\n") {
      break;
    }
  }
  let response = String::from_utf8_lossy(&response[..response.len() - 2]).into_owned();
  parse_response(&response).with_context(|| format!("index service refused the mail: {response}"))
}

fn collect_files(directory: &path::Path, files: &mut Vec<path::PathBuf>) -> io::Result<()> {
  for entry in fs::read_dir(directory)? {
    let path = entry?.path();
    if path.is_dir() {
      collect_files(&path, files)?;
    } else if path.is_file() {
      files.push(path);
    }
  }
  Ok(())
}

pub fn run(
  source: &path::Path,
  archive_root: &path::Path,
  address: &str,
  port: u16,
  timeout: Option<time::Duration>,
  threads: num::NonZeroUsize,
) -> anyhow::Result<u64> {
  anyhow::ensure!(source.is_dir(), "{source:?} is not a directory");
  anyhow::ensure!(archive_root.is_dir(), "{archive_root:?} is not a directory");
  let mut files = Vec::new();
  collect_files(source, &mut files)?;
  log::info!("submitting {} file(s) from {source:?}", files.len());
  let queue = sync::Mutex::new(files);
  let inserted = crossbeam_utils::thread::scope(|scope| {
    let handles: Vec<_> = (0..threads.get())
      .map(|_| {
        scope.spawn(|_| {
          let mut inserted = 0u64;
          loop {
            let file = match queue.lock().unwrap().pop() {
              Some(file) => file,
              None => break,
            };
            let raw = match fs::read(&file) {
              Ok(raw) => raw,
              Err(error) => {
                log::warn!("couldn't read {file:?}: {error}");
                continue;
              }
            };
            match submit_one(address, port, timeout, &raw) {
              Ok((mail_id, subdir)) => {
                let directory = archive_root.join(&subdir);
                let target = directory.join(mail_id.to_string());
                let filed = fs::create_dir_all(&directory).and_then(|_| fs::write(&target, &raw));
                match filed {
                  Ok(()) => {
                    log::debug!("{file:?} inserted as {target:?}");
                    inserted += 1;
                  }
                  Err(error) => log::warn!("couldn't file {file:?} under {target:?}: {error}"),
                }
              }
              Err(error) => log::warn!("couldn't insert {file:?}: {error:#}"),
            }
          }
          inserted
        })
      })
      .collect();
    handles.into_iter().map(|handle| handle.join().unwrap()).sum::<u64>()
  })
  .expect("archive worker panicked");
  log::info!("{inserted} mail(s) inserted into the archive");
  Ok(inserted)
}
