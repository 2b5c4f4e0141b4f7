// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxorule - rule processing
// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxcfxics - change numbers, PCLs
// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxctabl - table state machine
// https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/ms-oxnspi - address book
//
// The library is the per-mailbox rule-processing and delivery core of a
// groupware mail server: it evaluates a folder's rules against freshly
// delivered messages, materialises the side effects (move/copy/tag/read/
// delete/auto-reply), books resource mailboxes, re-homes named properties on
// cross-store copies and keeps change-number/PCL bookkeeping intact. The
// binary is the archive ingester, which feeds stored RFC-5322 files into the
// archive index service.

use std::{num, path, time};

pub mod abtree;
pub mod archive;
pub mod autoreply;
pub mod booking;
pub mod namedprop;
pub mod propval;
pub mod restriction;
pub mod rop;
pub mod rules;
pub mod store;
pub mod table;

fn parse_duration(argument: &str) -> Result<time::Duration, num::ParseIntError> {
  Ok(time::Duration::from_secs(argument.parse()?))
}

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(help = "Directory of RFC-5322 files to ingest")]
  pub source: String,
  #[arg(help = "Archive area accepted bodies are filed under")]
  pub archive: String,

  #[arg(long = "address", help = "Index service address")]
  pub address: String,
  #[arg(long = "port", help = "Index service port", default_value_t = 5556)]
  pub port: u16,
  #[arg(long = "timeout", help = "TCP timeout (in seconds)", value_parser = parse_duration)]
  pub timeout: Option<time::Duration>,
  #[arg(
    long = "threads",
    help = "Number of worker threads to spawn",
    default_value_t = num::NonZeroUsize::new(8).unwrap()
  )]
  pub threads: num::NonZeroUsize,
}

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  archive::run(
    path::Path::new(&arguments.source),
    path::Path::new(&arguments.archive),
    &arguments.address,
    arguments.port,
    arguments.timeout,
    arguments.threads,
  )?;
  Ok(())
}
