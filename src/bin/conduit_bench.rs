use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use hdrhistogram::Histogram;
use log::{info, warn};

use conduit::{
    pipepair, Clock, CommandSink, Context, EventHandler, Handle, Mailbox, Msg, PairConfig, Pipe,
    PipeState, PipeStatus, QuantaClock, ReactorConfig, ReactorThread,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Round-trip latency between two pipe endpoints", long_about = None)]
struct Args {
    /// Measured round trips
    #[arg(short, long, default_value_t = 100_000)]
    messages: u64,

    /// Round trips discarded before measuring
    #[arg(long, default_value_t = 1_000)]
    warmup: u64,

    /// Payload size in bytes
    #[arg(short, long, default_value_t = 64)]
    size: usize,

    /// High watermark for both directions (0 = unbounded)
    #[arg(long, default_value_t = 1000)]
    hwm: u64,

    /// CPU core for the ping (main) thread
    #[arg(long)]
    ping_core: Option<usize>,

    /// CPU core for the echo reactor thread
    #[arg(long)]
    pong_core: Option<usize>,

    /// Run the echo reactor without blocking in the poller
    #[arg(long)]
    low_latency: bool,
}

fn pin(core_id: Option<usize>) -> Result<()> {
    let Some(core_id) = core_id else {
        return Ok(());
    };
    let core_ids = core_affinity::get_core_ids().context("Failed to get core IDs")?;
    if core_id >= core_ids.len() {
        bail!("Core ID {} out of range ({} cores available)", core_id, core_ids.len());
    }
    info!("Pinning {:?} to core {}", std::thread::current().name(), core_id);
    core_affinity::set_for_current(core_ids[core_id]);
    Ok(())
}

/// Echoes every message back to the sender until the pipe terminates.
struct Echo {
    mailbox: Arc<Mailbox>,
    pipe: Option<Pipe>,
}

impl Echo {
    fn drain(&mut self, cx: &mut Context) {
        loop {
            let envelope = match self.mailbox.try_recv() {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(err) => {
                    warn!("echo mailbox: {err}");
                    cx.stop();
                    return;
                }
            };
            let Some(pipe) = self.pipe.as_mut() else {
                break;
            };
            match pipe.process_command(envelope.command, &mut ()) {
                Ok(PipeStatus::Alive) => {}
                Ok(PipeStatus::Terminated) => {
                    info!("echo pipe terminated");
                    self.pipe = None;
                    cx.stop();
                    return;
                }
                Err(err) => {
                    warn!("echo pipe: {err}");
                    cx.stop();
                    return;
                }
            }
        }
    }

    fn echo(&mut self) {
        let Some(pipe) = self.pipe.as_mut() else {
            return;
        };
        loop {
            // Past Active only the delimiter matters; keep reading to reach it.
            let active = pipe.state() == PipeState::Active;
            if active && !pipe.check_write() {
                break;
            }
            let Some(msg) = pipe.read() else {
                break;
            };
            if active {
                if let Err(msg) = pipe.write(msg) {
                    warn!("echo dropped {} bytes", msg.len());
                }
            }
        }
        pipe.flush();
    }
}

impl EventHandler for Echo {
    fn on_readable(&mut self, _handle: Handle, cx: &mut Context) {
        self.drain(cx);
        self.echo();
    }

    fn on_timer(&mut self, _id: u64, _handle: Handle, _cx: &mut Context) {
        self.echo();
    }
}

struct Ping {
    mailbox: Arc<Mailbox>,
    pipe: Pipe,
}

impl Ping {
    fn process_one(&mut self) -> Result<PipeStatus> {
        let Some(envelope) = self.mailbox.recv(Some(Duration::from_secs(5)))? else {
            bail!("no command from the echo side within 5s (state {:?})", self.pipe.state());
        };
        Ok(self.pipe.process_command(envelope.command, &mut ())?)
    }

    fn round_trip(&mut self, payload: &[u8]) -> Result<()> {
        let mut msg = Msg::new(payload);
        loop {
            match self.pipe.write(msg) {
                Ok(()) => break,
                Err(refused) => {
                    msg = refused;
                    self.process_one()?;
                }
            }
        }
        self.pipe.flush();

        loop {
            if let Some(reply) = self.pipe.read() {
                if reply.len() != payload.len() {
                    bail!("reply of {} bytes, sent {}", reply.len(), payload.len());
                }
                return Ok(());
            }
            self.process_one()?;
        }
    }

    fn shutdown(mut self) -> Result<()> {
        self.pipe.terminate(false);
        while self.process_one()? != PipeStatus::Terminated {}
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let ping_mailbox = Arc::new(Mailbox::new()?);
    let pong_mailbox = Arc::new(Mailbox::new()?);
    let (ping_pipe, pong_pipe) = pipepair(
        [
            Arc::clone(&ping_mailbox) as Arc<dyn CommandSink>,
            Arc::clone(&pong_mailbox) as Arc<dyn CommandSink>,
        ],
        PairConfig::with_hwm(args.hwm),
    );

    let config = if args.low_latency {
        ReactorConfig::low_latency()
    } else {
        ReactorConfig::default()
    };
    let pong_core = args.pong_core;
    let echo_thread = ReactorThread::spawn("conduit-echo", config, move |reactor| {
        if let Err(err) = pin(pong_core) {
            warn!("echo thread not pinned: {err:#}");
        }
        let cx = reactor.context();
        let fd = pong_mailbox.fd();
        let handle = cx.add_fd(
            fd,
            Box::new(Echo {
                mailbox: pong_mailbox,
                pipe: Some(pong_pipe),
            }),
        );
        cx.set_pollin(handle);
        cx.add_timer(Duration::ZERO, handle, 0);
        Ok(())
    })?;

    pin(args.ping_core)?;
    let mut ping = Ping {
        mailbox: ping_mailbox,
        pipe: ping_pipe,
    };
    // Put the inbound side to sleep so the first reply raises a command.
    let _ = ping.pipe.read();

    let payload = vec![0u8; args.size];
    info!("Warming up with {} round trips", args.warmup);
    for _ in 0..args.warmup {
        ping.round_trip(&payload)?;
    }

    let clock = QuantaClock::new();
    let mut histogram = Histogram::<u64>::new(3)?;
    info!("Measuring {} round trips of {} bytes", args.messages, args.size);
    let started = clock.now();
    for _ in 0..args.messages {
        let sent = clock.now();
        ping.round_trip(&payload)?;
        let _ = histogram.record(clock.now().saturating_sub(sent));
    }
    let elapsed_ns = clock.now().saturating_sub(started).max(1);

    ping.shutdown()?;
    echo_thread.stop()?;

    println!("Round-trip latency (ns), {} samples:", histogram.len());
    println!("  Min:  {}", histogram.min());
    println!("  P50:  {}", histogram.value_at_quantile(0.50));
    println!("  P99:  {}", histogram.value_at_quantile(0.99));
    println!("  P999: {}", histogram.value_at_quantile(0.999));
    println!("  Max:  {}", histogram.max());
    println!(
        "Throughput: {:.0} round trips/s",
        args.messages as f64 * 1e9 / elapsed_ns as f64
    );
    Ok(())
}
