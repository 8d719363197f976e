use recaptcha_bridge::BridgeConfig;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {}", e);
        }
    }

    recaptcha_bridge::init_logging();

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = recaptcha_bridge::run(config).await {
        log::error!("Token bridge failed: {}", e);
        std::process::exit(1);
    }
}
