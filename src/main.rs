/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use stagecast::crypto::LongLivedKey;
use stagecast::event_loop::{EventLoop, LoopResult, RuleOutcome};
use stagecast::{Result, Server, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "stagecast-server", about = "Low-latency audio conferencing server")]
struct Args {
    /// UDP address to bind
    #[arg(short, long, default_value = "0.0.0.0:9004")]
    listen: SocketAddr,

    /// One key file per client, as produced by stagecast-keygen
    #[arg(required = true)]
    keyfiles: Vec<PathBuf>,
}

fn run(args: &Args) -> Result<()> {
    let mut keys = Vec::new();
    for path in &args.keyfiles {
        let key = LongLivedKey::load(path)?;
        log::info!("loaded key for '{}' (id {})", key.name, key.id);
        keys.push(key);
    }

    let config = ServerConfig { listen: args.listen };
    let mut server = Server::new(&config, keys)?;

    let mut el = EventLoop::<Server>::new();
    el.add_readable_rule(
        "receive datagrams",
        server.socket_fd(),
        Box::new(|server| {
            server.receive_datagrams()?;
            Ok(RuleOutcome::Continue)
        }),
        Some(Box::new(|server: &mut Server| {
            server.note_socket_recovery();
            RuleOutcome::Continue
        })),
    );
    el.add_background_rule(
        "advance clock",
        Box::new(|server: &Server| server.tick_due(Instant::now())),
        Box::new(|server| {
            server.service_clock(Instant::now())?;
            Ok(RuleOutcome::Continue)
        }),
    );
    el.add_background_rule(
        "statistics",
        Box::new(|server: &Server| server.stats_due(Instant::now())),
        Box::new(|server| {
            server.print_summary(Instant::now());
            Ok(RuleOutcome::Continue)
        }),
    );
    el.add_background_rule(
        "housekeeping",
        Box::new(|server: &Server| server.housekeeping_due(Instant::now())),
        Box::new(|server| {
            server.housekeeping(Instant::now());
            Ok(RuleOutcome::Continue)
        }),
    );

    loop {
        if el.wait_next_event(&mut server, Duration::from_millis(1))? == LoopResult::Exit {
            return Ok(());
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}
