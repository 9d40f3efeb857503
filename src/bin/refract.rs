use anyhow::Result;
use clap::Parser;
use refract::relay::Relay;
use refract::settings::Settings;
use refract::status::{Status, StatusSink, TextSink};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "refract", version, about = "RTMP fan-out relay")]
struct Args {
    /// Bind address for the inbound RTMP server
    #[arg(long, default_value = ":1935")]
    bind: String,

    /// Path to the endpoint configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stream-key secret; publishes whose path does not end with it are
    /// rejected
    #[arg(long)]
    key: Option<String>,

    /// Output URLs, each added as an enabled endpoint
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();
    let settings = Settings::resolve(&args.bind, args.key, args.config, args.urls)?;

    let sink: Arc<dyn StatusSink> = Arc::new(TextSink);
    sink.log(
        Status::Ok,
        concat!("refract v", env!("CARGO_PKG_VERSION")),
    );
    sink.log(Status::Ok, "Starting RTMP server...");

    let mut relay = Relay::new(settings, sink);
    relay.run().await
}
