//! drivecast - disk and partition cloning over file, LAN, or chain
//!
//! The binary is a thin shell: argument parsing, a progress display,
//! and signal-driven cancellation around the library orchestrator.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};

use drivecast::logger::{Logger, NoopLogger, TextLogger};
use drivecast::progress::{Operation, ProgressListener};
use drivecast::{CancelToken, Job, Mode, NetOptions, Orchestrator, Role};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Clone GNU/Linux disks and partitions to images, over LAN, or down a relay chain"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Append run events to this log file
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Append one JSON record per finished run to this journal
    #[arg(long, global = true)]
    journal: Option<PathBuf>,

    /// Hide the progress display
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an image file from a disk or partition
    Create {
        /// Source block device, e.g. /dev/sda or /dev/sda2
        device: PathBuf,
        /// Image file to write
        image: PathBuf,
    },
    /// Restore an image file onto a disk or partition
    Restore {
        /// Image file to read
        image: PathBuf,
        /// Target block device
        device: PathBuf,
    },
    /// Send a device or image to receivers on the network
    Send {
        /// Device or image file to send
        source: PathBuf,
        /// Transport: unicast, multicast, or link
        #[arg(long, default_value = "unicast")]
        mode: String,
        /// Unicast: number of receivers to wait for
        #[arg(long, default_value_t = 1)]
        receivers: usize,
        /// Unicast: seconds to keep accepting before starting
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Receive a stream into a device or image file
    Receive {
        /// Target device or image file
        dest: PathBuf,
        /// Transport: unicast, multicast, or link
        #[arg(long, default_value = "unicast")]
        mode: String,
        /// Unicast: address of the sender
        #[arg(long)]
        from: Option<IpAddr>,
    },
}

/// Cargo-style progress display: scrolling operation lines above a
/// live spinner with throughput.
struct CliProgress {
    spinner: ProgressBar,
    start_time: Instant,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self {
            spinner,
            start_time: Instant::now(),
        }
    }

    fn print_line(&self, verb: &str, detail: &str) {
        self.spinner.suspend(|| {
            println!(
                "  {} {}",
                verb.with(Color::Green).bold(),
                detail.with(Color::Cyan)
            );
        });
    }

    fn finish(&self, bytes: u64) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.1 {
            format!(" ({:.1} MB/s)", bytes as f64 / elapsed / 1_048_576.0)
        } else {
            String::new()
        };
        self.spinner.finish_with_message(format!(
            "{} {:.1} MB in {:.1}s{}",
            "Completed".with(Color::Green).bold(),
            bytes as f64 / 1_048_576.0,
            elapsed,
            throughput
        ));
    }

    fn fail(&self, msg: &str) {
        self.spinner
            .finish_with_message(format!("{} {}", "Failed".with(Color::Red).bold(), msg));
    }
}

fn op_label(op: &Operation) -> String {
    use drivecast::progress::OperationKind::*;
    let name = match op.kind {
        WaitClients => "Waiting for receivers",
        WaitServer => "Waiting for sender",
        ReadPartitionTable => "Reading partition table",
        TransferData => "Transferring data",
        WritePartitionTable => "Writing partition table",
        WritePartitionFlags => "Writing partition flags",
    };
    if op.target.is_empty() {
        name.to_string()
    } else {
        format!("{name} {}", op.target)
    }
}

/// Routes library progress events into the spinner display.
struct DisplayListener {
    progress: Option<CliProgress>,
    logger: Arc<dyn Logger>,
}

impl ProgressListener for DisplayListener {
    fn operation_added(&self, op: &Operation) {
        self.logger.start(&format!("{:?}", op.kind), &op.target);
        if let Some(p) = &self.progress {
            p.print_line("Start", &op_label(op));
        }
    }

    fn operation_completed(&self, op: &Operation) {
        self.logger.completed(&format!("{:?}", op.kind), &op.target);
        if let Some(p) = &self.progress {
            p.print_line("Done", &op_label(op));
        }
    }

    fn new_connection(&self, peer: &str) {
        self.logger.connection(peer);
        if let Some(p) = &self.progress {
            p.print_line("Connected", peer);
        }
    }

    fn warning(&self, msg: &str) {
        self.logger.warning(msg);
        if let Some(p) = &self.progress {
            p.print_line("Warning", msg);
        } else {
            eprintln!("warning: {msg}");
        }
    }

    fn transfer(&self, transferred: u64, total: u64) {
        if let Some(p) = &self.progress {
            let pct = if total > 0 {
                (transferred as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            p.spinner.set_message(format!(
                "Transferring {:.1} / {:.1} MB ({pct:.0}%)",
                transferred as f64 / 1_048_576.0,
                total as f64 / 1_048_576.0
            ));
        }
    }
}

fn parse_mode(s: &str) -> Result<Mode> {
    match s {
        "unicast" => Ok(Mode::Unicast),
        "multicast" => Ok(Mode::Multicast),
        "link" => Ok(Mode::Link),
        other => anyhow::bail!("unknown mode {other:?}; use unicast, multicast, or link"),
    }
}

/// A path argument is a device when it names a block device; anything
/// else is an image file.
fn split_target(path: PathBuf) -> (Option<PathBuf>, Option<PathBuf>) {
    if drivecast::parted::is_block_device(&path) {
        (Some(path), None)
    } else {
        (None, Some(path))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let logger: Arc<dyn Logger> = match &args.log {
        Some(path) => Arc::new(TextLogger::new(path).context("opening log file")?),
        None => Arc::new(NoopLogger),
    };
    let listener = Arc::new(DisplayListener {
        progress: if args.quiet {
            None
        } else {
            Some(CliProgress::new())
        },
        logger: logger.clone(),
    });

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc_handler(move || cancel.cancel());
    }

    let mut orchestrator = Orchestrator::new(listener.clone(), cancel);
    if let Some(path) = &args.journal {
        orchestrator.set_run_log(path);
    }
    let started = Instant::now();

    let result = match args.command {
        Command::Create { device, image } => orchestrator.create_image(&device, &image),
        Command::Restore { image, device } => orchestrator.restore_image(&image, &device),
        Command::Send {
            source,
            mode,
            receivers,
            timeout,
        } => {
            let mode = parse_mode(&mode)?;
            let (device, image) = split_target(source);
            let job = Job {
                role: Role::Send,
                mode,
                image,
                device,
            };
            let opts = NetOptions {
                receivers,
                accept_deadline: timeout.map(Duration::from_secs),
                ..NetOptions::default()
            };
            orchestrator.run(&job, &opts)
        }
        Command::Receive { dest, mode, from } => {
            let mode = parse_mode(&mode)?;
            let (device, image) = split_target(dest);
            let job = Job {
                role: Role::Receive,
                mode,
                image,
                device,
            };
            let opts = NetOptions {
                sender: from,
                ..NetOptions::default()
            };
            orchestrator.run(&job, &opts)
        }
    };

    let bytes = orchestrator.transferred();
    match result {
        Ok(()) => {
            logger.done(bytes, started.elapsed().as_secs_f64());
            if let Some(p) = &listener.progress {
                p.finish(bytes);
            }
            Ok(())
        }
        Err(e) => {
            logger.error("run", &e.to_string());
            if let Some(p) = &listener.progress {
                p.fail(&e.to_string());
            }
            Err(e.into())
        }
    }
}

/// SIGINT sets the cancel flag; the pipeline raises `Cancel` at the
/// next chunk boundary and unwinds through the shutdown handler.
fn ctrlc_handler(on_interrupt: impl Fn() + Send + Sync + 'static) {
    use std::sync::atomic::{AtomicBool, Ordering};

    // The handler only flips an atomic; a watcher thread does the rest
    // outside async-signal context.
    static INTERRUPTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn handler(_sig: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    std::thread::spawn(move || loop {
        if INTERRUPTED.swap(false, Ordering::SeqCst) {
            on_interrupt();
        }
        std::thread::sleep(Duration::from_millis(100));
    });
}
