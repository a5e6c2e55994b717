use atlas_shield::{config::ShieldConfig, init_tracing, run};
use std::process;

#[tokio::main]
async fn main() {
    // Configuration errors are fatal before anything else starts
    let config = match ShieldConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            eprintln!("REDIS_URL is required; see SHIELD_* variables for overrides");
            process::exit(1);
        }
    };

    init_tracing(config.environment);

    if let Err(e) = run(config).await {
        eprintln!("atlas-shield error: {}", e);
        process::exit(1);
    }
}
