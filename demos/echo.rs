//! Echo server demo.
//!
//! ```text
//! cargo run --example echo -- --listen tcp://127.0.0.1:9000 --multicore
//! printf 'hello' | nc 127.0.0.1 9000
//! ```

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gantry::{serve, Action, Conn, EventHandler, LoadBalancing, Options};

#[derive(Parser, Debug)]
#[command(name = "echo")]
#[command(about = "gantry echo server", long_about = None)]
struct Args {
    /// Proto address to serve (tcp://host:port or udp://host:port)
    #[arg(short, long, default_value = "tcp://127.0.0.1:9000")]
    listen: String,

    /// Use one event loop per CPU core
    #[arg(short, long)]
    multicore: bool,

    /// Explicit event loop count (overrides --multicore)
    #[arg(short = 'n', long, default_value_t = 0)]
    num_event_loop: usize,

    /// Distributed accept with SO_REUSEPORT
    #[arg(short, long)]
    reuse_port: bool,

    /// Load balancing policy
    #[arg(long, value_parser = parse_lb, default_value = "round_robin")]
    lb: LoadBalancing,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_lb(s: &str) -> std::result::Result<LoadBalancing, String> {
    match s {
        "round_robin" => Ok(LoadBalancing::RoundRobin),
        "least_connections" => Ok(LoadBalancing::LeastConnections),
        "source_addr_hash" => Ok(LoadBalancing::SourceAddrHash),
        other => Err(format!("unknown balancing policy: {other}")),
    }
}

struct Echo;

impl EventHandler for Echo {
    fn on_init_complete(&self, svr: &gantry::Server) -> Action {
        info!(addr = %svr.addr, loops = svr.num_event_loop, "echo server ready");
        Action::None
    }

    fn react(&self, frame: &[u8], _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (Some(frame.to_vec()), Action::None)
    }
}

fn main() -> Result<(), gantry::Error> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let options = Options {
        multicore: args.multicore,
        num_event_loop: args.num_event_loop,
        reuse_port: args.reuse_port,
        lb: args.lb,
        ..Default::default()
    };

    serve(Echo, &args.listen, options)
}
