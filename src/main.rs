use classroom_sync::config::Config;
use classroom_sync::{relay, telemetry};

#[tokio::main]
async fn main() {
    telemetry::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let state = relay::RelayState::new();
    let routes = relay::routes(state);
    let address = config.bind_address();

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting classroom relay"
    );
    warp::serve(routes).run(address).await;
}
