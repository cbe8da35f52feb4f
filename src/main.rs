use clap::Parser;
use inv_easy::app::App;
use inv_easy::cli::Args;
use inv_easy::config::Config;
use inv_easy::logging::setup_logging;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Logging depends on the config, so a config error can only go to stderr
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    setup_logging(&config, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_SHORT"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        check_only = args.check_only,
        "starting inv-easy"
    );

    let app = match App::new(config) {
        Ok(app) => app,
        Err(e) => {
            error!(error = format!("{e:#}"), "Failed to initialize application");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = app.startup().await {
        error!(
            error = format!("{:#}", anyhow::Error::new(e)),
            "Startup aborted"
        );
        app.close().await;
        return ExitCode::FAILURE;
    }

    if args.check_only {
        app.close().await;
        return ExitCode::SUCCESS;
    }

    app.run().await
}
