use bridge::actors::bridge::{BridgeEvent, BridgeHandle, ChannelListener};
use bridge::actors::bus::BroadcastBusActor;
use bridge::config::BridgeConfig;
use ractor::Actor;
use shared_types::{
    calculate_credit_gain, describe_credit_gain, JobDescriptor, Priority, TaskType,
};
use tokio::sync::mpsc;

fn load_env_file() {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine current directory for .env lookup");
            return;
        }
    };

    // Search the current directory and ancestors so running from `bridge/`
    // still picks up a repo-root `.env`.
    let mut current = cwd.clone();
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            match dotenvy::from_path(&candidate) {
                Ok(_) => {
                    tracing::info!(path = %candidate.display(), "Loaded environment from .env");
                }
                Err(e) => {
                    tracing::warn!(path = %candidate.display(), error = %e, "Failed to load .env file");
                }
            }
            return;
        }
        if !current.pop() {
            break;
        }
    }

    tracing::info!(
        cwd = %cwd.display(),
        "No .env file found; using process environment only"
    );
}

/// Demo driver: probe for a worker-agent, fall back to the simulation when
/// nobody answers, run one job, and print the credit reward.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    load_env_file();

    tracing::info!("Starting scrape-job bridge demo");

    let config = BridgeConfig::from_env();
    tracing::info!(?config, "Bridge configuration");

    let (bus, _) = Actor::spawn(None, BroadcastBusActor, ()).await?;

    let (tx, mut events) = mpsc::unbounded_channel();
    let (listener, _) = Actor::spawn(None, ChannelListener, tx).await?;
    let bridge = BridgeHandle::spawn(bus, listener, config).await?;

    let target_site =
        std::env::var("BRIDGE_DEMO_SITE").unwrap_or_else(|_| "market.example".to_string());
    let keyword =
        std::env::var("BRIDGE_DEMO_KEYWORD").unwrap_or_else(|_| "vintage camera".to_string());
    let page_target = std::env::var("BRIDGE_DEMO_PAGES")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(3);
    let job = JobDescriptor::new(target_site, keyword, TaskType::OpenOnNew)
        .with_parameter("page_target", serde_json::json!(page_target));
    tracing::info!(job_id = %job.job_id, page_target, "Prepared demo job");

    while let Some(event) = events.recv().await {
        match event {
            BridgeEvent::StatusChange(false) => {
                tracing::info!("No worker-agent answered; falling back to simulation");
                bridge.start_simulation(job.clone())?;
            }
            BridgeEvent::StatusChange(true) => {
                tracing::info!("Worker-agent present; dispatching");
                if let Err(e) = bridge.dispatch(job.clone()).await {
                    tracing::warn!(error = %e, "Dispatch rejected");
                }
            }
            BridgeEvent::Progress { pages, ads } => {
                tracing::info!(pages, ads, "Scrape progress");
            }
            BridgeEvent::Complete { pages, ads } => {
                tracing::info!(pages, ads, "Scrape complete");
                let reward = calculate_credit_gain(Priority::High, job.task_type, Some(36.0));
                tracing::info!(
                    total = reward.total,
                    capped = reward.is_capped,
                    "Reward: {}",
                    describe_credit_gain(&reward)
                );
                break;
            }
            BridgeEvent::Error(reason) => {
                tracing::error!(reason = %reason, "Scrape failed");
                break;
            }
        }
    }

    bridge.shutdown();
    Ok(())
}
