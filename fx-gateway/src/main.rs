use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use fx_gateway::{config::Config, handlers};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    init_tracing();

    info!("Starting FX gateway...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().map_err(anyhow::Error::msg)?;
    let ledger_config = config
        .ledger_config()
        .context("Failed to load ledger configuration")?;

    info!(
        pool_size = ledger_config.supervisor.pool_size,
        initial_writer = ledger_config.supervisor.initial_writer,
        data_dir = ?ledger_config.data_dir,
        "Configuration loaded successfully"
    );

    let (supervisor, supervisor_task) =
        fx_ledger::start(ledger_config).context("Failed to start worker pool")?;
    let supervisor_data = web::Data::new(supervisor.clone());

    info!(
        "Starting HTTP server on {}:{}",
        config.server.host, config.server.port
    );

    let server = HttpServer::new(move || {
        App::new()
            .app_data(supervisor_data.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers)
    .bind((config.server.host.clone(), config.server.port))?
    .run();
    let server_handle = server.handle();

    tokio::select! {
        result = server => {
            result.context("HTTP server failed")?;
        }
        joined = supervisor_task => {
            error!("Worker supervisor stopped, shutting down HTTP server");
            server_handle.stop(true).await;
            joined
                .context("Supervisor task failed")?
                .context("Supervisor stopped")?;
            return Ok(());
        }
    }

    info!("HTTP server stopped, shutting down workers");
    supervisor
        .shutdown()
        .await
        .context("Failed to shut down worker pool")?;

    Ok(())
}
