use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use camera_ingest::config::IngestConfig;
use camera_ingest::error::{IngestError, Result};
use camera_ingest::{api, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path; environment variables override its values
    #[arg(short, long)]
    config: Option<String>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = IngestConfig::load(args.config.as_deref())?;
    init_logging(&config.log_level)?;

    info!(bind = %config.http_bind_addr, "starting camera-ingest");

    let state = AppState::new(config.clone())?;
    state.registry.load_persisted().await;

    let registry = state.registry.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .app_data(web::JsonConfig::default().error_handler(|err, _| {
                IngestError::Validation(err.to_string()).into()
            }))
            .wrap(Cors::permissive())
            .configure(api::configure)
    })
    .bind(&config.http_bind_addr)
    .map_err(|e| {
        IngestError::Config(format!("failed to bind {}: {e}", config.http_bind_addr))
    })?
    .run();

    server.await?;

    info!("http server stopped, stopping cameras");
    registry.shutdown().await;
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| IngestError::Config(format!("invalid log_level: {e}")))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
