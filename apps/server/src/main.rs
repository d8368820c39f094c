#![warn(clippy::all, clippy::pedantic)]

use std::net::SocketAddr;
use std::path::PathBuf;

use actix_web::{App, HttpServer, web};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{debug, info};

mod config;
mod error;
mod routes;
mod state;

use config::Config;
use error::AppError;
use logger::init_with_level;
use state::AppState;

/// Tenant-scoped uptime probing with live status streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file, created with defaults when missing
    #[arg(short = 'c', long, env = "SITEWATCH_CONFIG")]
    config: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<(), AppError> {
    dotenv().ok();
    let args = Args::parse();

    let config = Config::from_config(args.config.as_deref())?;
    init_with_level(&config.server.log_level);
    debug!("{config}");

    let addr = SocketAddr::new(config.server.bind.parse()?, config.server.port);
    let state = AppState::from_config(&config).await?;
    run_server(addr, state).await
}

async fn run_server(addr: SocketAddr, state: AppState) -> Result<(), AppError> {
    let state = web::Data::new(state);
    info!(%addr, "starting HTTP server");

    HttpServer::new(move || App::new().app_data(state.clone()).configure(routes::routes))
        .bind(addr)?
        .run()
        .await?;

    Ok(())
}
