/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use camlink_core::config::SessionConfig;
use camlink_core::coordinator::SessionCoordinator;
use camlink_core::hub_client::HubSignalStore;
use camlink_core::media::{MediaController, SampleFeedDevice};
use camlink_core::metrics::SessionMetrics;
use camlink_core::signal_store::{SignalStore, SqliteSignalStore};
use camlink_core::transport::WebrtcTransportFactory;
use camlink_protocol::{Role, StartSessionRequest};
use directories::ProjectDirs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct NodeConfig {
    /// "capture" or "viewer".
    role: Option<String>,
    endpoint_id: Option<String>,
    viewer_id: Option<String>,
    /// Remote hub; when unset a local SQLite store is used.
    hub_url: Option<String>,
    hub_token: Option<String>,
    db_path: Option<String>,
    /// Capture side: whether a microphone feed is present.
    audio: Option<bool>,
    ttl_secs: Option<u64>,
    #[serde(default)]
    session: SessionConfig,
}

fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("CAMLINK_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "camlink", "Camlink").context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("net", "camlink", "Camlink").context("unable to determine platform config dir")?;
    Ok(proj.config_dir().join("config.json"))
}

fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("CAMLINK_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    default_config_path()
}

fn env_override(slot: &mut Option<String>, key: &str) {
    if let Ok(v) = std::env::var(key) {
        let v = v.trim().to_string();
        if !v.is_empty() {
            *slot = Some(v);
        }
    }
}

fn load_config() -> Result<NodeConfig> {
    let path = parse_config_path()?;
    let mut cfg = match std::fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str::<NodeConfig>(&text).with_context(|| format!("parse {}", path.display()))?,
        Err(e) => {
            warn!("config missing: {} ({e}), using environment only", path.display());
            NodeConfig::default()
        }
    };
    env_override(&mut cfg.role, "CAMLINK_ROLE");
    env_override(&mut cfg.endpoint_id, "CAMLINK_ENDPOINT");
    env_override(&mut cfg.viewer_id, "CAMLINK_VIEWER");
    env_override(&mut cfg.hub_url, "CAMLINK_HUB_URL");
    env_override(&mut cfg.hub_token, "CAMLINK_HUB_TOKEN");
    env_override(&mut cfg.db_path, "CAMLINK_DB");
    if let Some(v) = std::env::var("CAMLINK_AUDIO").ok().and_then(|v| v.parse::<bool>().ok()) {
        cfg.audio = Some(v);
    }
    Ok(cfg)
}

fn build_store(cfg: &NodeConfig) -> Result<Arc<dyn SignalStore>> {
    if let Some(url) = cfg.hub_url.as_deref() {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("build http client")?;
        info!("signal store: hub {url}");
        return Ok(Arc::new(HubSignalStore::new(http, url, cfg.hub_token.clone())));
    }
    let path = match cfg.db_path.as_deref() {
        Some(p) => PathBuf::from(p),
        None => {
            let dir = default_data_dir()?;
            std::fs::create_dir_all(&dir).with_context(|| format!("create data dir: {}", dir.display()))?;
            dir.join("camlink.db")
        }
    };
    info!("signal store: sqlite {}", path.display());
    Ok(Arc::new(SqliteSignalStore::open(&path, 2_000)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = load_config()?;
    let role: Role = cfg.role.as_deref().unwrap_or("viewer").parse()?;
    let endpoint_id = cfg.endpoint_id.clone().context("endpoint_id is required")?;
    let settings = cfg.session.resolve();
    let store = build_store(&cfg)?;
    let transports = Arc::new(WebrtcTransportFactory::new()?);
    let metrics = Arc::new(SessionMetrics::new());

    let media = match role {
        Role::Capture => {
            let device = Arc::new(SampleFeedDevice::new(true, cfg.audio.unwrap_or(true)));
            Some(MediaController::new(
                device,
                settings.preferred_video,
                settings.minimal_video,
                settings.acquire_retry.delay_for(0),
                metrics.clone(),
            ))
        }
        Role::Viewer => None,
    };
    let coordinator = SessionCoordinator::new(settings, store, transports, media, metrics);
    info!(version = camlink_core::version(), %role, endpoint = %endpoint_id, "camlink node starting");

    match role {
        Role::Capture => {
            let report = coordinator.hardware_check().await;
            info!("hardware: {}", serde_json::to_string(&report)?);
            let cancel = CancellationToken::new();
            let agent = {
                let coordinator = coordinator.clone();
                let cancel = cancel.clone();
                let endpoint_id = endpoint_id.clone();
                tokio::spawn(async move { coordinator.run_capture_agent(&endpoint_id, cancel).await })
            };
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            info!("shutdown requested");
            cancel.cancel();
            if let Err(e) = agent.await {
                warn!("capture agent task failed: {e}");
            }
        }
        Role::Viewer => {
            let viewer_id = cfg.viewer_id.clone().unwrap_or_else(|| "viewer".to_string());
            let ticket = coordinator
                .start(
                    Role::Viewer,
                    StartSessionRequest {
                        endpoint_id: endpoint_id.clone(),
                        viewer_id,
                        session_id: None,
                        ttl_secs: cfg.ttl_secs,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&ticket)?);
            let handle = coordinator
                .session(&ticket.session_id)
                .context("session settled before it could be watched")?;
            tokio::select! {
                outcome = handle.wait() => {
                    info!("session settled: {}", serde_json::to_string(&outcome)?);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    coordinator.stop(&ticket.session_id).await?;
                }
            }
        }
    }

    info!("metrics: {}", serde_json::to_string(&coordinator.metrics())?);
    Ok(())
}
