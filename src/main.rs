use anyhow::Result;
use clap::{CommandFactory, Parser};
use tcp_tap::{Acceptor, Cli, Config};
use tracing::{Level, info};

fn usage_exit(error: &anyhow::Error) -> ! {
    eprintln!("error: {error:#}\n");
    eprintln!("{}", Cli::command().render_usage());
    std::process::exit(1);
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    // stdout is reserved for filter matches.
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };
    init_tracing(cli.verbose);

    let config = Config::from_cli(cli).unwrap_or_else(|e| usage_exit(&e));
    let ctx = config.relay_context().unwrap_or_else(|e| usage_exit(&e));

    if let Some(path) = &config.log_file {
        info!(log_file = %path.display(), "Packet logging enabled");
    }
    for pattern in &config.patterns {
        info!(pattern = %pattern, "Pattern added to filter chain");
    }
    info!(
        listen_addr = %config.listen,
        upstream_addr = %config.upstream,
        high_watermark = config.settings.high_watermark,
        read_chunk_size = config.settings.read_chunk_size,
        "Configuration loaded"
    );

    let acceptor = Acceptor::bind(config.listen, config.upstream, ctx).await?;
    acceptor.serve().await
}
