//! vring: poke at shared memory ring topics from the command line.
//!
//! # Usage
//!
//! ```bash
//! vring publish --topic cam --count 100 --wait-readers 1
//! vring subscribe --topic cam --count 100
//! vring hold --topic cam --count 3     # take 3 buffers, never release, wait to be killed
//! vring status --topic cam
//! ```
//!
//! Messages carry a little-endian `u64` sequence number in their first 8 bytes.
//! Lines meant for a driving process (`attached`, `ready`, `seq`) go to stdout;
//! logs go to stderr.

use std::io::Write;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vring::{Reader, ReaderConfig, VringConfig, VringError, Writer};

#[derive(Parser, Debug)]
#[command(name = "vring")]
#[command(about = "Publish, subscribe and inspect shared memory ring topics")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a topic and publish sequence-numbered messages.
    Publish {
        #[arg(long)]
        topic: String,
        /// Number of messages to publish.
        #[arg(long, default_value_t = 10)]
        count: u64,
        /// Payload length of every message (at least 8).
        #[arg(long, default_value_t = 16)]
        len: usize,
        /// Pause between messages.
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
        /// Wait until this many readers are attached before publishing.
        #[arg(long, default_value_t = 0)]
        wait_readers: usize,
        /// Keep the topic alive this long after the last message.
        #[arg(long, default_value_t = 0)]
        linger_ms: u64,
        #[command(flatten)]
        shape: ShapeArgs,
    },
    /// Attach to a topic and print received sequence numbers.
    Subscribe {
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 10)]
        count: u64,
        /// Give up after this long without a message.
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        #[arg(long, default_value_t = 100)]
        heartbeat_ms: u64,
    },
    /// Attach, take buffers without releasing them, then sleep until killed.
    Hold {
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 1)]
        count: u64,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        #[arg(long, default_value_t = 100)]
        heartbeat_ms: u64,
    },
    /// Print a diagnostics snapshot without attaching as a reader.
    Status {
        #[arg(long)]
        topic: String,
    },
}

#[derive(clap::Args, Debug)]
struct ShapeArgs {
    #[arg(long, default_value_t = 4096)]
    msg_size: u32,
    #[arg(long, default_value_t = 16)]
    num_desc: u32,
    #[arg(long, default_value_t = 8)]
    max_readers: u32,
    #[arg(long, default_value_t = 500)]
    monitor_ms: u64,
    #[arg(long, default_value_t = 2000)]
    stale_ms: u64,
    /// Remove names left behind by a crashed writer first.
    #[arg(long)]
    replace: bool,
}

impl ShapeArgs {
    fn config(&self) -> VringConfig {
        VringConfig::default()
            .with_msg_size(self.msg_size)
            .with_num_desc(self.num_desc)
            .with_max_readers(self.max_readers)
            .with_monitor_period(Duration::from_millis(self.monitor_ms))
            .with_stale_after(Duration::from_millis(self.stale_ms))
            .with_replace_existing(self.replace)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let args = Args::parse();
    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, errno = e.errno(), "vring failed");
            ExitCode::FAILURE
        }
    }
}

/// Print a line for the driving process and flush it right away.
fn say(line: std::fmt::Arguments<'_>) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
}

fn run(command: Command) -> Result<(), VringError> {
    match command {
        Command::Publish {
            topic,
            count,
            len,
            interval_ms,
            wait_readers,
            linger_ms,
            shape,
        } => {
            if shape.msg_size < 8 {
                return Err(VringError::InvalidConfig(
                    "publish needs --msg-size of at least 8 for the sequence number",
                ));
            }
            let writer = Writer::create(&topic, shape.config())?;
            wait_for_readers(&writer, wait_readers);
            say(format_args!("created {}", writer.names().segment()));

            let mut delivered = 0u64;
            for seq in 0..count {
                let written = len.clamp(8, shape.msg_size as usize);
                let mut loan = writer.get(Duration::from_secs(5))?;
                loan.as_mut_slice()[..8].copy_from_slice(&seq.to_le_bytes());
                match writer.put(loan, written) {
                    Ok(()) => delivered += 1,
                    Err(VringError::NoReaders) => tracing::debug!(seq, "no reader attached"),
                    Err(e) => return Err(e),
                }
                if interval_ms > 0 {
                    std::thread::sleep(Duration::from_millis(interval_ms));
                }
            }
            say(format_args!("published {delivered}/{count}"));
            std::thread::sleep(Duration::from_millis(linger_ms));
            Ok(())
        }
        Command::Subscribe {
            topic,
            count,
            timeout_ms,
            heartbeat_ms,
        } => {
            let reader = open_reader(&topic, heartbeat_ms)?;
            say(format_args!("attached slot={}", reader.slot()));
            for _ in 0..count {
                let sample = reader.get(Duration::from_millis(timeout_ms))?;
                say(format_args!("seq {} len {}", sequence(sample.as_slice()), sample.len()));
                reader.put(sample)?;
            }
            reader.close()
        }
        Command::Hold {
            topic,
            count,
            timeout_ms,
            heartbeat_ms,
        } => {
            let reader = open_reader(&topic, heartbeat_ms)?;
            say(format_args!("attached slot={}", reader.slot()));
            let mut held = Vec::new();
            for _ in 0..count {
                held.push(reader.get(Duration::from_millis(timeout_ms))?);
            }
            let indices: Vec<u32> = held.iter().map(|s| s.index()).collect();
            say(format_args!("ready {indices:?}"));
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
        Command::Status { topic } => {
            let status = vring::inspect(&topic)?;
            print!("{status}");
            Ok(())
        }
    }
}

fn open_reader(topic: &str, heartbeat_ms: u64) -> Result<Reader, VringError> {
    Reader::open(
        topic,
        ReaderConfig::default().with_heartbeat_period(Duration::from_millis(heartbeat_ms)),
    )
}

fn wait_for_readers(writer: &Writer, wanted: usize) {
    if wanted == 0 {
        return;
    }
    let start = Instant::now();
    while writer.status().attached_readers() < wanted {
        if start.elapsed() > Duration::from_secs(30) {
            tracing::warn!(wanted, "gave up waiting for readers");
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn sequence(payload: &[u8]) -> u64 {
    payload
        .get(..8)
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(u64::from_le_bytes)
        .unwrap_or(u64::MAX)
}
