//! GridDFS daemon: runs the coordinator and the storage nodes
//! configured for this process over the in-process message broker

#[macro_use]
extern crate tracing;

mod server;

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "griddfs")]
struct Opt {
	/// Configuration file
	#[structopt(short = "c", long = "config", default_value = "./griddfs.toml")]
	pub config_file: PathBuf,
}

#[tokio::main]
async fn main() {
	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "griddfs=info")
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	let opt = Opt::from_args();
	if let Err(e) = server::run_server(opt.config_file).await {
		error!("{}", e);
		std::process::exit(1);
	}
}
