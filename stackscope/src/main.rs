use std::fs::File;
use std::io::{BufReader, BufWriter, Write};

use anyhow::{Context, Result};
use clap::Parser;

use stackscope::cli::{Args, Format};
use stackscope::export;
use stackscope::mojo::MojoReader;

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let file = File::open(&args.input)
        .with_context(|| format!("cannot open {}", args.input.display()))?;
    let reader = BufReader::new(file);

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    match args.format {
        Format::Fold => {
            let trace = export::decode(reader).context("failed to decode profile")?;
            if trace.truncated {
                log::warn!("stream was truncated mid-event; decoded the intact prefix");
            }
            export::write_folded(&trace, &mut out)?;
        }
        Format::Json => {
            let trace = export::decode(reader).context("failed to decode profile")?;
            let summary = export::summarize(&trace);
            serde_json::to_writer_pretty(&mut out, &summary)?;
            writeln!(out)?;
        }
        Format::Dump => {
            let mut reader = MojoReader::new(reader);
            let version = reader.read_header().context("bad stream header")?;
            writeln!(out, "# MOJ version {version}")?;
            loop {
                match reader.next_event() {
                    Ok(Some(event)) => writeln!(out, "{event:?}")?,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("stopping at decode error: {e}");
                        break;
                    }
                }
            }
        }
    }

    out.flush()?;
    Ok(())
}
