//! Initiator demo: read the peer's greeting, then overwrite it.

use std::process::ExitCode;

use farmem::{role, Config};

fn usage(program: &str) -> ExitCode {
    eprintln!("usage: {program} <host> [--config <file>]");
    ExitCode::from(2)
}

fn parse_args() -> Result<(String, Config), ExitCode> {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "farmem-initiator".into());
    let mut host = None;
    let mut config = Config::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => {
                    config = Config::load_toml(&path).map_err(|e| {
                        eprintln!("{program}: {e}");
                        ExitCode::from(2)
                    })?;
                }
                None => return Err(usage(&program)),
            },
            _ if host.is_none() && !arg.starts_with('-') => host = Some(arg),
            _ => return Err(usage(&program)),
        }
    }
    match host {
        Some(host) => Ok((host, config)),
        None => Err(usage(&program)),
    }
}

fn printable(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn main() -> ExitCode {
    env_logger::init();
    let (host, config) = match parse_args() {
        Ok(parsed) => parsed,
        Err(code) => return code,
    };

    match role::initiator::run(&host, &config) {
        Ok(outcome) => {
            println!(
                "descriptor: addr={:#x} rkey={:#x}",
                outcome.descriptor.addr, outcome.descriptor.rkey
            );
            println!("bulk payload: \"{}\"", printable(&outcome.bulk));
            println!("remote region read: \"{}\"", printable(&outcome.observed));
            println!("after write, read back: \"{}\"", printable(&outcome.verified));
            println!("verification passed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("initiator failed: {e}");
            ExitCode::FAILURE
        }
    }
}
