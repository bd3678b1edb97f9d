use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use registry_raft::config::Config;
use registry_raft::harness::Harness;

/// Replicated registry consensus node.
#[derive(Parser, Debug)]
#[command(name = "registry-raftd", version)]
struct Args {
	/// Path to a TOML configuration file (see Config for the expected shape).
	#[arg(short, long)]
	config: std::path::PathBuf,
}

fn install_shutdown_handler() -> oneshot::Receiver<()> {
	let (tx, rx) = oneshot::channel();
	let tx = Arc::new(Mutex::new(Some(tx)));
	ctrlc::set_handler(move || {
		if let Some(tx) = tx.lock().unwrap().take() {
			let _ = tx.send(());
		}
	})
	.expect("installing ctrl-c handler");
	rx
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

	let args = Args::parse();
	let config = match Config::load(&args.config) {
		Ok(c) => c,
		Err(e) => {
			error!(error = %e, "failed to load configuration");
			std::process::exit(1);
		}
	};

	let addr: SocketAddr = match config.node.address.parse() {
		Ok(a) => a,
		Err(e) => {
			error!(address = %config.node.address, error = %e, "invalid node.address");
			std::process::exit(1);
		}
	};

	let harness = match Harness::new(&config) {
		Ok(h) => h,
		Err(e) => {
			error!(error = %e, "failed to initialize raft harness");
			std::process::exit(1);
		}
	};
	info!(id = %harness.id(), %addr, "starting registry-raftd");

	let shutdown_signal = install_shutdown_handler();
	let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();

	let harness_for_ticker = harness.clone();
	let ticker = tokio::spawn(async move {
		harness_for_ticker.run(async { let _ = http_shutdown_rx.await; }).await;
	});

	let serve_result = tokio::select! {
		result = registry_raft::http::serve(harness.clone(), addr, async { let _ = shutdown_signal.await; }) => result,
	};
	let _ = http_shutdown_tx.send(());
	let _ = ticker.await;

	if let Err(e) = serve_result {
		error!(error = %e, "http server exited with error");
		std::process::exit(1);
	}
}
