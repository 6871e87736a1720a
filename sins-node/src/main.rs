// sins-node: runs one allocation-network agent (allocator or load) per process.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sins_core::{
    inbound_handler, run_agent, Allocation, AllocationId, Allocator, Envelope, Identity,
    InboundHandler, Link, Load, MessageType, NodeId, RecordLog, Scheduler, Transport,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sins-node", version, about = "Allocator and Load agents for the sins allocation network")]
struct Cli {
    /// Config file (default: ~/.config/sins/config.toml, then /etc/sins/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the allocator
    Allocator {
        /// Listen address; `*` means all interfaces
        #[arg(long, default_value = "*:5555")]
        bind: String,
        /// Host loads should reply to; defaults to the bound address
        #[arg(long)]
        advertise: Option<String>,
        /// Send a fresh allocation to every known node this often (seconds)
        #[arg(long)]
        every: Option<f64>,
        /// Value of each planned allocation
        #[arg(long, default_value_t = 1.0)]
        value: f64,
        /// Hold time of each planned allocation (seconds)
        #[arg(long, default_value_t = 5.0)]
        duration: f64,
        /// Stop the network after this many seconds
        #[arg(long)]
        run_for: Option<f64>,
        /// Override alloc_ack_timeout (seconds)
        #[arg(long)]
        alloc_ack_timeout: Option<f64>,
        /// Override stop_ack_timeout (seconds)
        #[arg(long)]
        stop_ack_timeout: Option<f64>,
    },
    /// Run a load and join an allocator
    Load {
        #[arg(long, default_value = "127.0.0.1:0")]
        bind: String,
        /// Host the allocator should reach this load at; defaults to the bound address
        #[arg(long)]
        advertise: Option<String>,
        /// Allocator address
        #[arg(long, default_value = "127.0.0.1:5555")]
        allocator: String,
        /// Write sim_<mode>_<params>.log records here
        #[arg(long)]
        log_dir: Option<PathBuf>,
        #[arg(long, default_value = "run")]
        mode: String,
        #[arg(long, default_value = "0")]
        params: String,
        /// Report the current allocation this often (seconds)
        #[arg(long)]
        report_every: Option<f64>,
    },
    /// Ask a running allocator to stop the network
    Stop {
        #[arg(long, default_value = "127.0.0.1:5555")]
        allocator: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct RoundPlan {
    every: Duration,
    value: f64,
    duration: Duration,
}

type AllocatorAgent = Allocator<Transport>;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sins_core=debug,sins_node=debug")),
        )
        .init();

    let cli = Cli::parse();
    let mut file = config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Allocator {
            bind,
            advertise,
            every,
            value,
            duration,
            run_for,
            alloc_ack_timeout,
            stop_ack_timeout,
        } => {
            if let Some(t) = alloc_ack_timeout {
                file.alloc_ack_timeout = t;
            }
            if let Some(t) = stop_ack_timeout {
                file.stop_ack_timeout = t;
            }
            let plan = every
                .map(|every| -> anyhow::Result<RoundPlan> {
                    Ok(RoundPlan {
                        every: config::seconds("--every", every)?,
                        value,
                        duration: config::seconds("--duration", duration)?,
                    })
                })
                .transpose()?;
            let run_for = run_for.map(|s| config::seconds("--run-for", s)).transpose()?;
            let identity = advertise.map_or(Identity::Anonymous, Identity::Host);
            run_allocator(file.into_core()?, &bind, identity, plan, run_for)
        }
        Command::Load {
            bind,
            advertise,
            allocator,
            log_dir,
            mode,
            params,
            report_every,
        } => {
            if report_every.is_some() {
                file.report_interval = report_every;
            }
            let records = log_dir.as_deref().map(|dir| (dir, mode.as_str(), params.as_str()));
            let identity = advertise.map_or(Identity::Address, Identity::Host);
            run_load(file.into_core()?, &bind, identity, NodeId::new(allocator), records)
        }
        Command::Stop { allocator } => send_stop(file.into_core()?, NodeId::new(allocator)),
    }
}

fn run_allocator(
    cfg: sins_core::Config,
    bind: &str,
    identity: Identity,
    plan: Option<RoundPlan>,
    run_for: Option<Duration>,
) -> anyhow::Result<()> {
    let mut sched: Scheduler<AllocatorAgent> = Scheduler::new();
    let transport = Transport::bind(bind, identity, cfg.transport, inbound_handler(sched.mailbox()))
        .with_context(|| format!("starting allocator on {}", bind))?;
    let id = transport.local_id();
    if id.has_unspecified_host() {
        warn!(%id, "bound to all interfaces; remote loads reply to the address they joined (see --advertise)");
    }
    let mut allocator = Allocator::new(id.clone(), transport, cfg.allocator);
    allocator.set_allocation_updated(|payload, node| info!(%node, ?payload, "allocation updated"));

    if let Some(plan) = plan {
        sched.schedule(plan.every, move |a: &mut AllocatorAgent, s: &mut Scheduler<AllocatorAgent>| {
            allocation_round(a, s, plan)
        });
    }
    if let Some(after) = run_for {
        sched.schedule(after, |a: &mut AllocatorAgent, s: &mut Scheduler<AllocatorAgent>| {
            a.stop_network(s)
        });
    }

    info!(%id, "allocator running");
    run_agent(&mut allocator, &mut sched)?;
    info!(nodes = allocator.node_count(), failures = allocator.failures().len(), "allocator exited");
    Ok(())
}

/// Send a fresh allocation to every known node, then re-arm.
fn allocation_round(allocator: &mut AllocatorAgent, sched: &mut Scheduler<AllocatorAgent>, plan: RoundPlan) {
    if allocator.is_stopping() {
        return;
    }
    let nodes = allocator.node_ids();
    debug!(nodes = nodes.len(), "allocation round");
    for node in nodes {
        let allocation = Allocation::new(AllocationId::generate(), plan.value, plan.duration);
        allocator.send_allocation(&node, allocation, sched);
    }
    sched.schedule(plan.every, move |a: &mut AllocatorAgent, s: &mut Scheduler<AllocatorAgent>| {
        allocation_round(a, s, plan)
    });
}

fn run_load(
    cfg: sins_core::Config,
    bind: &str,
    identity: Identity,
    allocator: NodeId,
    records: Option<(&Path, &str, &str)>,
) -> anyhow::Result<()> {
    let mut sched: Scheduler<Load<Transport>> = Scheduler::new();
    let transport = Transport::bind(bind, identity, cfg.transport, inbound_handler(sched.mailbox()))
        .with_context(|| format!("starting load on {}", bind))?;
    let id = transport.local_id();
    let mut load = Load::new(id.clone(), transport, cfg.load);
    if let Some((dir, mode, params)) = records {
        let log = RecordLog::create(dir, mode, params)
            .with_context(|| format!("opening record log in {}", dir.display()))?;
        info!(path = %log.path().display(), "recording applied allocations");
        load = load.with_record_log(log);
    }

    sched.schedule(Duration::ZERO, move |l: &mut Load<Transport>, s: &mut Scheduler<Load<Transport>>| {
        l.join(allocator, s)
    });
    info!(%id, "load running");
    run_agent(&mut load, &mut sched)?;
    info!(applied = load.applied(), "load exited");
    Ok(())
}

/// One-shot operator request: `stop` to the allocator, flushed before exit.
fn send_stop(cfg: sins_core::Config, allocator: NodeId) -> anyhow::Result<()> {
    let ignore: InboundHandler = Arc::new(|envelope: Envelope| debug!(%envelope, "ignored"));
    let mut transport = Transport::bind("0.0.0.0:0", Identity::Address, cfg.transport, ignore)
        .context("starting stop client")?;
    let envelope = Envelope::new(MessageType::Stop, transport.local_id(), allocator.clone());
    transport.send(envelope, &allocator);
    transport.stop();
    info!(%allocator, "stop sent");
    Ok(())
}
