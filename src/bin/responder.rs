//! Responder demo: expose a greeting region and watch it change.

use std::process::ExitCode;
use std::time::Duration;

use farmem::{role, Config};

/// How often and how long the observation loop looks at the region.
const OBSERVE_ROUNDS: usize = 20;
const OBSERVE_INTERVAL: Duration = Duration::from_secs(5);

fn usage(program: &str) -> ExitCode {
    eprintln!("usage: {program} [--config <file>]");
    ExitCode::from(2)
}

fn parse_args() -> Result<Config, ExitCode> {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "farmem-responder".into());
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
            _ => return Err(usage(&program)),
        }
    }
    Ok(config)
}

fn printable_prefix(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn main() -> ExitCode {
    env_logger::init();
    let config = match parse_args() {
        Ok(c) => c,
        Err(code) => return code,
    };

    let mut served = match role::responder::run(&config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("responder failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("serving {} from port {}", served.peer_addr(), config.port);
    println!("region before: \"{}\"", printable_prefix(served.region_bytes()));

    // The peer modifies the region without any local completion, so the
    // only way to notice is to look.
    for round in 0..OBSERVE_ROUNDS {
        if served.wait_disconnect(OBSERVE_INTERVAL) {
            println!("peer disconnected");
            break;
        }
        let prefix = printable_prefix(served.region_bytes());
        println!("[{round:2}] region: \"{prefix}\"");
        if prefix.contains("CLIENT") {
            println!("remote write observed");
            break;
        }
    }

    println!("region after: \"{}\"", printable_prefix(served.region_bytes()));
    ExitCode::SUCCESS
}
