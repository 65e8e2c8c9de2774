use agent_deal::{
    config::{AppConfig, LogFormat, LoggingConfig},
    service::{build_router, AppState},
};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deal-service")]
#[command(about = "Negotiation, settlement and reputation service for agent deals")]
struct Args {
    #[arg(short, long, env = "AGENT_DEAL_CONFIG")]
    config: Option<String>,

    #[arg(short, long, env = "AGENT_DEAL_PORT")]
    port: Option<u16>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Full => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load_with_env_overrides(path)?,
        None => AppConfig::default(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_tracing(&config.logging);
    config.validate()?;

    let state = AppState::from_config(&config)?;
    let app = build_router(state);

    let address = config.get_server_address();
    let listener = TcpListener::bind(&address).await?;
    tracing::info!(
        %address,
        signing = ?config.settlement.signing,
        max_rounds = config.negotiation.max_rounds,
        "Deal service listening"
    );

    axum::serve(listener, app).await?;

    Ok(())
}
