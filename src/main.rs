use noticemq::{logger, server, settings::Settings};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Config file selection: `-c`/`--config` argument, then the CONFIG_PATH
/// environment variable. Without either, only the default lookup paths
/// and environment variables apply.
fn config_path() -> Option<String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    for (i, arg) in args.iter().enumerate() {
        if arg == "-c" || arg == "--config" {
            if let Some(path) = args.get(i + 1) {
                return Some(path.clone());
            }
        }
        if let Some(path) = arg.strip_prefix("-c=") {
            return Some(path.to_string());
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    std::env::var("CONFIG_PATH").ok()
}

#[tokio::main]
async fn main() {
    if std::env::args().any(|a| a == "--version" || a == "-v") {
        println!("noticemq {VERSION}");
        return;
    }

    let settings = match Settings::load(config_path().as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = logger::logger_init(&settings.log) {
        eprintln!("failed to initialize logger: {e}");
        std::process::exit(1);
    }

    log::info!("starting noticemq, version: {VERSION}");

    if let Err(e) = server::run(settings).await {
        log::error!("server failed, {e:?}");
        std::process::exit(1);
    }
}
