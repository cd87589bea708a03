// Command-line front end for a durable log: append, commit, scan, and
// truncate against a directory on disk. Argument dispatch is manual rather
// than via a clap-derived parser, since the surface is four verbs with
// simple flags.

use std::path::PathBuf;
use std::process::ExitCode;

use durable_log::{Log, LogConfig};
use tracing::{error, info};

fn print_usage() {
    eprintln!(
        "usage: durable-log-cli --dir <path> <command> [args]\n\
         \n\
         commands:\n\
         \x20 append <text>          append one entry and commit\n\
         \x20 scan [from]            print committed entries from an address (default 0)\n\
         \x20 truncate <address>     discard read access below an address\n\
         \x20 status                 print the log's current watermarks"
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "durable-log-cli: command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> durable_log::Result<()> {
    let mut args = std::env::args().skip(1).collect::<Vec<_>>();

    let mut directory = PathBuf::from("./data");
    if let Some(pos) = args.iter().position(|a| a == "--dir") {
        if pos + 1 >= args.len() {
            print_usage();
            return Ok(());
        }
        directory = PathBuf::from(args.remove(pos + 1));
        args.remove(pos);
    }

    let Some(command) = args.first().cloned() else {
        print_usage();
        return Ok(());
    };

    let log = Log::open(LogConfig {
        directory,
        ..LogConfig::default()
    })
    .await?;

    match command.as_str() {
        "append" => {
            let text = args.get(1).cloned().unwrap_or_default();
            let addr = log.enqueue_and_wait_for_commit(text.as_bytes()).await?;
            println!("{addr}");
        }
        "scan" => {
            let from: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
            let mut scan = log.scan(from, None);
            while let Some((addr, payload)) = scan.next().await? {
                println!("{addr}\t{}", String::from_utf8_lossy(&payload));
            }
        }
        "truncate" => {
            let Some(addr) = args.get(1).and_then(|s| s.parse::<u64>().ok()) else {
                print_usage();
                return Ok(());
            };
            log.truncate_until(addr).await?;
            info!(address = addr, "durable-log-cli: truncated");
        }
        "status" => {
            println!("begin_address:           {}", log.begin_address());
            println!("tail_address:            {}", log.tail_address());
            println!("committed_until_address: {}", log.committed_until_address());
            println!("flushed_until_address:   {}", log.flushed_until_address());
        }
        other => {
            eprintln!("unknown command: {other}");
            print_usage();
        }
    }

    Ok(())
}
