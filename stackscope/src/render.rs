//! Output rendering: the binary event stream and the human-readable
//! "where" snapshot, behind one tagged dispatch.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use crate::domain::ConfigError;
use crate::frame::Frame;
use crate::mojo::MojoWriter;
use crate::strings::StringTable;

/// Environment variable naming the binary output file.
pub const OUTPUT_VAR: &str = "ECHION_OUTPUT";

/// Sink for rendered samples. Two flavours, chosen at start.
pub enum Renderer {
    Mojo(MojoWriter<BufWriter<File>>),
    Where(WhereRenderer),
}

impl Renderer {
    /// Open the binary renderer on the file named by [`OUTPUT_VAR`].
    ///
    /// # Errors
    /// [`ConfigError::Output`] when the variable is unset or the file
    /// cannot be created.
    pub fn open_mojo() -> Result<Self, ConfigError> {
        let path = std::env::var(OUTPUT_VAR)
            .map_err(|_| ConfigError::Output(format!("{OUTPUT_VAR} is not set")))?;
        let file = File::create(&path)
            .map_err(|e| ConfigError::Output(format!("cannot open {path}: {e}")))?;
        Ok(Renderer::Mojo(MojoWriter::new(BufWriter::new(file))))
    }

    #[must_use]
    pub fn new_where(out: Box<dyn Write + Send>) -> Self {
        Renderer::Where(WhereRenderer { out })
    }

    /// Stream preamble: magic and metadata, or the snapshot banner.
    ///
    /// # Errors
    /// I/O failure on the sink, here and below.
    pub fn begin(&mut self, mode: &str, interval_us: u64) -> io::Result<()> {
        match self {
            Renderer::Mojo(w) => {
                w.header()?;
                w.metadata("mode", mode)?;
                w.metadata("interval", &interval_us.to_string())?;
                w.metadata("sampler", concat!("stackscope ", env!("CARGO_PKG_VERSION")))
            }
            Renderer::Where(w) => writeln!(w.out, "\r\n🔎 stackscope reporting for duty\n"),
        }
    }

    pub fn stack_begin(&mut self, pid: i64, iid: i64, thread_name: &str) -> io::Result<()> {
        match self {
            Renderer::Mojo(w) => w.stack(pid, iid, thread_name),
            Renderer::Where(w) => writeln!(w.out, "    🧵 {thread_name}:"),
        }
    }

    /// Render a leaf-first stack root to leaf, hiding shim frames.
    pub fn render_frames(&mut self, frames: &[Arc<Frame>], strings: &StringTable) -> io::Result<()> {
        for frame in frames.iter().rev() {
            if frame.is_shim {
                continue;
            }
            match self {
                Renderer::Mojo(w) => w.frame(frame, strings)?,
                Renderer::Where(w) => w.frame(frame, strings)?,
            }
        }
        Ok(())
    }

    pub fn metric_time(&mut self, value: i64) -> io::Result<()> {
        match self {
            Renderer::Mojo(w) => w.metric_time(value),
            Renderer::Where(_) => Ok(()),
        }
    }

    pub fn metric_memory(&mut self, value: i64) -> io::Result<()> {
        match self {
            Renderer::Mojo(w) => w.metric_memory(value),
            Renderer::Where(_) => Ok(()),
        }
    }

    pub fn idle(&mut self) -> io::Result<()> {
        match self {
            Renderer::Mojo(w) => w.idle(),
            Renderer::Where(w) => writeln!(w.out, "          (idle)"),
        }
    }

    pub fn finish(&mut self) -> io::Result<()> {
        match self {
            Renderer::Mojo(w) => w.flush(),
            Renderer::Where(w) => w.out.flush(),
        }
    }
}

/// ANSI-coloured thread snapshot output.
pub struct WhereRenderer {
    out: Box<dyn Write + Send>,
}

impl WhereRenderer {
    fn frame(&mut self, frame: &Frame, strings: &StringTable) -> io::Result<()> {
        let filename = strings.get(frame.filename).unwrap_or_else(|| "<unknown file>".into());
        let name = strings.get(frame.name).unwrap_or_else(|| "<unknown function>".into());
        let line = frame.location.line;

        if filename.starts_with("native@") {
            writeln!(
                self.out,
                "          \x1b[38;5;248;1m{name}\x1b[0m \x1b[38;5;246m({filename}\x1b[0m:\x1b[38;5;246m{line})\x1b[0m"
            )
        } else {
            writeln!(
                self.out,
                "          \x1b[33;1m{name}\x1b[0m (\x1b[36m{filename}\x1b[0m:\x1b[32m{line}\x1b[0m)"
            )
        }
    }
}
