//! Process wiring for the `relaybot` subcommands.

use crate::config::RelayBotConfig;
use crate::controls::BotControls;
use crate::gateway::Gateway;
use crate::pipeline::ReplyPipeline;
use crate::scheduler::{DebounceWindow, TurnScheduler};
use crate::store::{Blacklist, DisabledMarker, HistoryStore};
use anyhow::{Context, Result};
use rb_channels::{BlueBubblesRelay, ChatRelay, ConversationId, EventSource, SenderId, WatchSource};
use rb_llm::LlmClient;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const INBOUND_QUEUE_CAPACITY: usize = 256;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayBotConfig::load_with_path(config_path).await?;
    let chain = cfg.llm.model_chain();
    tracing::info!(
        config_path = ?path,
        relay_base_url = %cfg.relay.base_url,
        relay_password_configured = !cfg.relay.password.is_empty(),
        fallback_scope = %cfg.relay.fallback_scope,
        priority_models = ?chain.priority_models,
        fallback_model = ?chain.fallback_model,
        system_prompt_configured = !chain.system_prompt.is_empty(),
        debounce_min_ms = cfg.scheduler.debounce_min_ms,
        debounce_max_ms = cfg.scheduler.debounce_max_ms,
        history_dir = %cfg.storage.history_dir.display(),
        history_lines = cfg.storage.history_lines,
        trusted_senders = cfg.admin.trusted_senders.len(),
        watch_command = ?cfg.watch.command,
        "config ok"
    );
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayBotConfig::load(config_path).await?;
    let controls = build_controls(&cfg);
    tracing::info!(
        disabled = controls.is_disabled().await,
        blocked = ?controls.blocked().await,
        trusted = ?controls.trusted(),
        "status ok"
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    conversation: &str,
    message: &str,
) -> Result<()> {
    let cfg = RelayBotConfig::load(config_path).await?;
    let relay = build_relay(&cfg)?;
    relay
        .send_text(&ConversationId::from(conversation), message)
        .await?;
    tracing::info!(conversation_id = %conversation, "message sent");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayBotConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = ?cfg_path,
        relay_base_url = %cfg.relay.base_url,
        models = cfg.llm.model_chain().len(),
        trusted_senders = cfg.admin.trusted_senders.len(),
        "starting relaybot"
    );

    let relay: Arc<dyn ChatRelay> = Arc::new(build_relay(&cfg)?);
    let controls = Arc::new(build_controls(&cfg));
    let llm = LlmClient::new(
        &cfg.llm.api_base_url,
        &cfg.llm.api_key,
        cfg.llm.request_timeout(),
        cfg.llm.model_chain(),
    );
    let pipeline = Arc::new(ReplyPipeline::new(
        llm,
        relay.clone(),
        HistoryStore::new(&cfg.storage.history_dir),
        cfg.storage.history_lines,
    ));
    let scheduler = Arc::new(TurnScheduler::new(
        pipeline,
        DebounceWindow::from_millis(cfg.scheduler.debounce_min_ms, cfg.scheduler.debounce_max_ms),
    ));
    let window = scheduler.window();
    tracing::info!(
        debounce_min_ms = window.min().as_millis() as u64,
        debounce_max_ms = window.max().as_millis() as u64,
        "scheduler ready"
    );

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let source = WatchSource::new(cfg.watch.command.clone());
    source
        .start(inbound_tx)
        .await
        .with_context(|| format!("start event source {}", source.source_id()))?;

    let gateway = Arc::new(Gateway::new(
        controls,
        relay,
        scheduler.clone(),
        cfg.relay.group_marker.clone(),
        inbound_rx,
    ));
    let mut gateway_handle = gateway.start();
    tracing::info!("gateway started");

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    tokio::select! {
        _ = &mut gateway_handle => {
            tracing::warn!("event stream ended; shutting down");
        }
        _ = shutdown.cancelled() => {
            gateway_handle.abort();
        }
    }

    tracing::info!(pending = scheduler.pending_count(), "stopping scheduler");
    let discarded = scheduler.shutdown();
    tracing::info!(discarded, "relaybot stopped");
    Ok(())
}

fn build_relay(cfg: &RelayBotConfig) -> Result<BlueBubblesRelay> {
    Ok(
        BlueBubblesRelay::new(&cfg.relay.base_url, &cfg.relay.password)?
            .with_resolve_timeout(cfg.relay.resolve_timeout())
            .with_send_timeout(cfg.relay.send_timeout())
            .with_fallback_scope(&cfg.relay.fallback_scope),
    )
}

fn build_controls(cfg: &RelayBotConfig) -> BotControls {
    BotControls::new(
        cfg.admin
            .trusted_senders
            .iter()
            .map(|s| SenderId::from(s.as_str())),
        DisabledMarker::new(&cfg.storage.disabled_marker),
        Blacklist::load(&cfg.storage.blacklist_file),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; shutting down");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; shutting down");
        }
    }
    shutdown.cancel();
}
