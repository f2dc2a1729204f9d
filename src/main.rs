use rttpd::config::ServerConfig;
use rttpd::server::Server;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let config = ServerConfig::load()?;
    let mut server = Server::bind(config)?;
    server.run()?;
    Ok(())
}
