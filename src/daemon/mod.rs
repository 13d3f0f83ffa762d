use crate::broker::{normalizer, Broker, TopicRegistry};
use crate::channels::{ChannelMessage, WhatsAppChannel};
use crate::config::Config;
use crate::gateway::AppState;
use crate::store::JsonFileStore;
use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const STATUS_FLUSH_SECONDS: u64 = 5;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;
const SHUTDOWN_GRACE_SECS: u64 = 30;

pub async fn run(config: Config, host: String, port: u16) -> Result<()> {
    config.validate()?;
    let wa_config = config
        .whatsapp
        .as_ref()
        .context("[whatsapp] is not configured; add access_token, phone_number_id and verify_token")?;

    let topics = TopicRegistry::load_or_seed(&config.topics_path()).await?;
    if topics.is_empty() {
        tracing::warn!(
            "No topics configured in {}; every request will be answered with an empty keyword list",
            config.topics_path().display()
        );
    }

    let whatsapp = Arc::new(WhatsAppChannel::from_config(wa_config));
    let store = Arc::new(JsonFileStore::new(config.state_path()));
    let broker = Arc::new(
        Broker::builder(whatsapp.clone(), topics, store)
            .config(&config)
            .normalizer(normalizer::from_config(&config.normalizer))
            .build(),
    );
    install_panic_flush(Arc::downgrade(&broker));

    crate::health::mark_component_ok("daemon");

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<ChannelMessage>(config.broker.queue_capacity.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let gateway_state = AppState::new(whatsapp, wa_config.app_secret.as_deref(), tx);

    let mut handles: Vec<JoinHandle<()>> = vec![spawn_state_writer(&config, cancel.clone())];

    {
        let host = host.clone();
        let component_cancel = cancel.clone();
        handles.push(spawn_component_supervisor(
            "gateway",
            INITIAL_BACKOFF_SECS,
            MAX_BACKOFF_SECS,
            cancel.clone(),
            move || {
                let host = host.clone();
                let state = gateway_state.clone();
                let cancel = component_cancel.clone();
                async move { crate::gateway::run_gateway(&host, port, state, cancel).await }
            },
        ));
    }

    {
        let broker = Arc::clone(&broker);
        let max_in_flight = config.broker.max_in_flight_messages;
        let component_cancel = cancel.clone();
        handles.push(spawn_component_supervisor(
            "dispatch",
            INITIAL_BACKOFF_SECS,
            MAX_BACKOFF_SECS,
            cancel.clone(),
            move || {
                let rx = Arc::clone(&rx);
                let broker = Arc::clone(&broker);
                let cancel = component_cancel.clone();
                async move {
                    let mut rx = rx.lock().await;
                    crate::channels::run_message_dispatch_loop(
                        &mut rx,
                        broker,
                        max_in_flight,
                        cancel,
                    )
                    .await;
                    Ok(())
                }
            },
        ));
    }

    {
        let broker = Arc::clone(&broker);
        let every = config.housekeeping.interval();
        let component_cancel = cancel.clone();
        handles.push(spawn_component_supervisor(
            "housekeeping",
            INITIAL_BACKOFF_SECS,
            MAX_BACKOFF_SECS,
            cancel.clone(),
            move || {
                let broker = Arc::clone(&broker);
                let cancel = component_cancel.clone();
                async move {
                    crate::broker::housekeeping::run(broker, every, cancel).await;
                    Ok(())
                }
            },
        ));
    }

    println!("📨 Inquiry broker started");
    println!("   Gateway:   http://{host}:{port}/whatsapp");
    println!("   Requester: {}", config.broker.requester);
    println!("   Topics:    {}", broker.topics().len());
    println!("   Ctrl+C to stop");

    shutdown_signal().await;
    tracing::info!("Shutdown requested");
    crate::health::mark_component_error("daemon", "shutdown requested");
    cancel.cancel();

    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), drain)
        .await
        .is_err()
    {
        tracing::warn!("Components did not stop within {SHUTDOWN_GRACE_SECS}s");
    }

    broker.flush().context("Failed to persist broker state on shutdown")?;
    tracing::info!("Broker state persisted");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Persist broker state before a panic unwinds the process.
fn install_panic_flush(broker: Weak<Broker>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(broker) = broker.upgrade() {
            if !broker.try_flush() {
                eprintln!("Broker state could not be persisted during panic");
            }
        }
        previous(info);
    }));
}

pub fn state_file_path(config: &Config) -> PathBuf {
    config
        .config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join("daemon_state.json")
}

fn spawn_state_writer(config: &Config, cancel: CancellationToken) -> JoinHandle<()> {
    let path = state_file_path(config);
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_FLUSH_SECONDS));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let mut json = crate::health::snapshot_json();
            if let Some(obj) = json.as_object_mut() {
                obj.insert(
                    "written_at".into(),
                    serde_json::json!(Utc::now().to_rfc3339()),
                );
            }
            let data = serde_json::to_vec_pretty(&json).unwrap_or_else(|_| b"{}".to_vec());
            let _ = tokio::fs::write(&path, data).await;
        }
    })
}

/// Run a component forever, restarting it with exponential backoff until
/// `cancel` fires.
fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    cancel: CancellationToken,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            crate::health::mark_component_ok(name);
            let result = run_component().await;
            if cancel.is_cancelled() {
                tracing::debug!("Daemon component '{name}' stopped");
                break;
            }

            match result {
                Ok(()) => {
                    crate::health::mark_component_error(name, "component exited unexpectedly");
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    crate::health::mark_component_error(name, e.to_string());
                    tracing::error!("Daemon component '{name}' failed: {e:#}");
                }
            }

            crate::health::bump_component_restart(name);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(backoff)) => {}
            }
            // Double after sleeping so the first failure waits the initial backoff.
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}
