use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clinic_network::api::{self, AppState};
use clinic_network::build_info;
use clinic_network::config::{AppConfig, LogConfig};
use clinic_network::events::EventBus;
use clinic_network::notify::{
    HttpNotificationSink, LogNotificationSink, NotificationDispatcher, NotificationSink,
};
use clinic_network::NetworkService;
use common_db::crypto::load_or_create_master_key;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Falha ao aguardar sinal de encerramento");
    }
    info!("Encerrando servidor");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.log);
    info!(
        version = build_info::PKG_VERSION,
        rustc = build_info::RUSTC_VERSION,
        "Iniciando clinic-network"
    );

    let pool = common_db::init_db_pool(&config.database).await?;
    let key = load_or_create_master_key(&pool, &config.database.key_phrase)
        .await
        .context("Falha ao abrir a chave de dados")?;

    let sink: Arc<dyn NotificationSink> = match &config.notifications.base_url {
        Some(base_url) => Arc::new(
            HttpNotificationSink::new(
                base_url,
                Duration::from_millis(config.notifications.timeout_ms),
            )
            .context("Falha ao criar cliente de notificações")?,
        ),
        None => Arc::new(LogNotificationSink),
    };
    let (notifier, notify_worker) =
        NotificationDispatcher::spawn(sink, config.notifications.queue_capacity);

    let service = NetworkService::new(
        pool.clone(),
        key,
        EventBus::new(config.server.event_capacity),
        notifier,
    );
    let state = AppState::new(service, &config.auth.jwt_secret);
    let streams = state.clone();
    let app = api::router(state, config.server.concurrency_limit);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Falha ao escutar em {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Servidor pronto");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            streams.close_streams();
        })
        .await?;

    // O roteador já foi descartado; a fila esvazia e a tarefa termina
    if let Err(e) = notify_worker.await {
        tracing::warn!(error = %e, "Tarefa de notificações terminou com erro");
    }
    pool.close().await;
    Ok(())
}
