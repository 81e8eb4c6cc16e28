mod auth;
mod cart;
mod checkout;
mod domains;
mod legal;
mod maintenance;
mod orders;
mod problem;
mod products;
mod router;
mod sellpages;
mod storefront;
mod stores;
mod telemetry;
#[cfg(test)]
mod test_support;
mod workspaces;

use std::{net::SocketAddr, time::Duration};

use shopfront_dns::{DohClient, DomainCheck};
use shopfront_storage::Database;
use shopfront_util::{load_env_file, AppConfig};
use tracing::info;
use url::Url;

const DOH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    let http = reqwest::Client::builder().timeout(DOH_TIMEOUT).build()?;
    let doh = DohClient::new(Url::parse(&config.doh_endpoint)?, http);
    let domain_check = DomainCheck::new(doh, config.edge_ips.clone());

    maintenance::MaintenanceWorker::new(database.clone(), domain_check.clone(), config.cart_ttl)
        .spawn();

    let state = router::AppState::new(metrics, database, &config, domain_check);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
