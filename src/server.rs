use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::api::{self, AppState};
use crate::broker::{Broker, BrokerConfig};
use crate::ratelimit::{self, Limiter};
use crate::settings::Settings;
use crate::store;
use crate::Result;

//everything after the termination signal must finish within this window
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

const WEB_DIR: &str = "web";

/// Bring the whole server up, then wait for a termination signal and take
/// it down in order: HTTP listener, broker, store, background tasks.
pub async fn run(settings: Settings) -> Result<()> {
    let store = Arc::new(store::Manager::new(&settings.storage.path, settings.storage.enabled));
    if store.is_enabled() {
        log::info!("message store enabled, path: {}", settings.storage.path);
    }

    let broker_cfg = BrokerConfig {
        session_expiry: settings.mqtt.session_expiry,
        message_expiry: settings.mqtt.message_expiry,
        token: settings.auth.token.clone(),
        storage_enabled: settings.storage.enabled,
        storage_path: settings.storage.path.clone(),
        default_topic: settings.mqtt.topic.clone(),
    };

    if settings.auth.generated {
        log::warn!("auth token was not configured, generated one, token: {}", settings.auth.token);
    } else {
        log::info!("auth enabled, token_length: {}", settings.auth.token.len());
    }

    let broker = Arc::new(
        Broker::start(broker_cfg, store.clone(), settings.mqtt.tcp_laddr()?, settings.mqtt.ws_laddr()?)
            .await?,
    );

    let limiter = Arc::new(Limiter::new(ratelimit::Config {
        max_failures: settings.rate_limit.max_failures,
        block_time: Duration::from_secs(settings.rate_limit.block_time.max(0) as u64),
        window_time: Duration::from_secs(settings.rate_limit.window_time.max(0) as u64),
    }));
    let eviction_task = limiter.start_eviction();

    let http_laddr = settings.http.laddr()?;
    let acceptor = api::bind(http_laddr).await?;
    log::info!("http server listening on {http_laddr}");
    log::info!("web console, url: http://localhost:{}/", settings.http.port);
    log::info!("webhook endpoint, url: POST http://localhost:{}/webhook", settings.http.port);
    log::info!("message history, url: GET http://localhost:{}/messages", settings.http.port);

    let state = AppState {
        broker: broker.clone(),
        store: store.clone(),
        limiter: limiter.clone(),
        settings: settings.clone(),
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let http_task = tokio::spawn(async move {
        if let Err(e) = api::serve(acceptor, state, WEB_DIR.into(), shutdown_rx).await {
            log::error!("http server error, {e:?}");
        }
    });

    wait_for_signal().await;
    log::info!("shutting down ...");

    let shutdown = async {
        let _ = shutdown_tx.send(());
        let _ = http_task.await;
        broker.close();
        store.close();
        eviction_task.abort();
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, shutdown).await.is_err() {
        log::warn!("shutdown deadline exceeded, exiting anyway");
    }

    log::info!("bye");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = term.recv() => {},
            }
        }
        Err(e) => {
            log::warn!("failed to install SIGTERM handler, {e:?}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
