use clap::Parser;
use std::path::PathBuf;

use stagecast::crypto::LongLivedKey;

#[derive(Debug, Parser)]
#[command(name = "stagecast-keygen", about = "Generate a client key file")]
struct Args {
    /// Human-readable client name
    name: String,

    /// Node id (must be unique per server)
    #[arg(long)]
    id: u8,

    /// Write the key file here instead of standard output
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    let key = LongLivedKey::generate(&args.name, args.id);
    let result = match &args.output {
        Some(path) => key.save(path),
        None => key.to_json().map(|json| println!("{json}")),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
