use std::io::{Read as _, Write as _};
use std::{fs, net, num, sync, thread, time};
use test_log::test;

// A minimal stand-in for the archive index service: greets with OK, accepts
// A-INST lines and files mails under incrementing ids.
fn index_service(listener: net::TcpListener, lines: sync::Arc<sync::Mutex<Vec<String>>>) {
  let mut next_id = 1;
  for stream in listener.incoming() {
    let mut stream = match stream {
      Ok(stream) => stream,
      Err(_) => return,
    };
    if stream.write_all(b"OK\r\n").is_err() {
      continue;
    }
    let mut request = Vec::new();
    let mut buffer = [0; 1024];
    loop {
      match stream.read(&mut buffer) {
        Ok(0) => break,
        Ok(read) => {
          request.extend_from_slice(&buffer[..read]);
          if request.ends_with(b"\r\n") {
            break;
          }
        }
        Err(_) => break,
      }
    }
    lines
      .lock()
      .unwrap()
      .push(String::from_utf8_lossy(&request).into_owned());
    let response = format!("TRUE {next_id} ar/ch\r\n");
    next_id += 1;
    let _ = stream.write_all(response.as_bytes());
  }
}

#[test]
fn directory_is_submitted_and_filed() -> anyhow::Result<()> {
  let port = portpicker::pick_unused_port().expect("no free port");
  let listener = net::TcpListener::bind(("127.0.0.1", port))?;
  let lines = sync::Arc::new(sync::Mutex::new(Vec::new()));
  let lines_ = sync::Arc::clone(&lines);
  thread::spawn(move || index_service(listener, lines_));

  let source = tempfile::tempdir()?;
  fs::create_dir_all(source.path().join("sub"))?;
  fs::write(
    source.path().join("one.eml"),
    "From: Alice <alice@ext.example>\r\nTo: bob@d20.example\r\nSubject: hello\r\n\r\nhi\r\n",
  )?;
  fs::write(
    source.path().join("sub/two.eml"),
    "From: carol@ext.example\r\nTo: bob@d20.example, dan@d20.example\r\nCc: eve@d20.example\r\nSubject: \"quoted\"\r\n\r\nbody\r\n",
  )?;
  let archive = tempfile::tempdir()?;

  let inserted = sift::archive::run(
    source.path(),
    archive.path(),
    "127.0.0.1",
    port,
    Some(time::Duration::from_secs(5)),
    num::NonZeroUsize::new(1).unwrap(),
  )?;
  assert_eq!(2, inserted);

  // Both bodies were filed under the subdir and ids the service answered.
  let filed: Vec<String> = (1..=2)
    .map(|id| {
      fs::read_to_string(archive.path().join("ar/ch").join(id.to_string())).unwrap()
    })
    .collect();
  assert_eq!(2, filed.len());
  assert!(filed.iter().any(|body| body.contains("Subject: hello")));

  let lines = lines.lock().unwrap();
  assert_eq!(2, lines.len());
  for line in lines.iter() {
    assert!(line.starts_with("A-INST "));
    assert!(line.contains("{\"file\":\"\","));
    assert!(line.ends_with("\r\n"));
  }
  // The envelope digest decodes to zero-terminated addresses.
  let envelope = lines
    .iter()
    .find(|line| line.contains("hello"))
    .unwrap()
    .split(' ')
    .nth(1)
    .unwrap()
    .to_string();
  use base64::Engine as _;
  let decoded = base64::engine::general_purpose::STANDARD.decode(envelope)?;
  assert_eq!(b"alice@ext.example\0bob@d20.example\0\0".to_vec(), decoded);
  Ok(())
}
