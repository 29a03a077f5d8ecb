//! Read back a raw recording through the reverse filter chain and print a
//! summary of what it contains.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde_json::json;

use readout_frames::{FrameChunk, TpcChunk};
use readoutd::recorder::writer::{BufferedFileReader, CompressionAlgorithm};

#[derive(Parser, Debug)]
#[command(name = "readout-dump")]
#[command(about = "Summarise a raw readout recording")]
struct Args {
    /// Recording file to read
    file: PathBuf,
    /// Compression the recording was written with
    #[arg(long, default_value = "none")]
    compression: CompressionAlgorithm,
    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut reader = BufferedFileReader::open(&args.file, args.compression)
        .with_context(|| format!("opening {}", args.file.display()))?;

    let span = TpcChunk::element_span();
    let mut elements = 0u64;
    let mut first_ts = None;
    let mut last_ts = None;
    let mut gaps = 0u64;

    while let Some(chunk) = reader
        .read_element::<TpcChunk>()
        .context("reading element")?
    {
        let ts = chunk.first_timestamp();
        if first_ts.is_none() {
            first_ts = Some(ts);
        }
        if let Some(previous) = last_ts {
            if ts.wrapping_sub(previous) != span {
                gaps += 1;
            }
        }
        last_ts = Some(ts);
        elements += 1;
    }

    if args.json {
        println!(
            "{}",
            json!({
                "file": args.file,
                "elements": elements,
                "first_timestamp": first_ts,
                "last_timestamp": last_ts,
                "timestamp_gaps": gaps,
            })
        );
    } else {
        println!("{}: {elements} elements", args.file.display());
        if let (Some(first), Some(last)) = (first_ts, last_ts) {
            println!("  timestamps {first} .. {last} ({gaps} gaps)");
        }
    }
    Ok(())
}
