use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
	/// Print the effective configuration and exit without binding any listeners.
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	let _log_flush = gateway_core::telemetry::setup_logging();

	let args = Args::parse();

	tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async move {
		let cfg = gateway::config::GatewayConfig::from_env()?;
		if args.validate_only {
			println!("{cfg:#?}");
			return Ok(());
		}
		run(cfg).await
	})
}

async fn run(cfg: gateway::config::GatewayConfig) -> anyhow::Result<()> {
	info!(http_addr = %cfg.http_addr, https_addr = %cfg.https_addr, control_addr = %cfg.control_addr, "starting gateway");
	gateway::app::run(cfg).await?.wait_termination().await
}
