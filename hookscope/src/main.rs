use anyhow::{Context, Result};
use hookscope::{logging, AgentConfig, HostResolver, StatusReporter, UProbeManager};
use hookscope_loader::AyaBackend;
use hookscope_process::{ProcFs, ProcTracker, Upid};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Fallback ceiling when no config file is provided: backed-off
/// processes are reconsidered at least every 4096 passes.
const DEFAULT_BACKOFF_CEILING: u32 = 1 << 12;

const PROC_SCAN_PERIOD: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    logging::initialize_logging(std::env::var("HOOKSCOPE_LOG_FILE").ok().as_deref())?;

    let cfg = match std::env::var("HOOKSCOPE_CONFIG") {
        Ok(path) => AgentConfig::from_file(&path)?,
        Err(_) => AgentConfig::with_ceiling(DEFAULT_BACKOFF_CEILING),
    };

    let bpf_object_path = std::env::var("HOOKSCOPE_BPF_OBJECT")
        .context("HOOKSCOPE_BPF_OBJECT must point at the probe-handler object")?;
    let bytecode = std::fs::read(&bpf_object_path)
        .with_context(|| format!("reading {bpf_object_path}"))?;
    let backend = AyaBackend::load(&bytecode).context("loading eBPF object")?;

    let procfs = ProcFs::new();
    let agent_pid = std::process::id();
    let agent_upid = Upid::new(
        1,
        agent_pid,
        procfs.start_time_ns(agent_pid).unwrap_or_default(),
    );

    let (reporter, status_stream) = StatusReporter::channel(agent_upid, 4096);
    let resolver = HostResolver::new(procfs.clone(), cfg.enable_http2_tracing);
    let manager = Arc::new(UProbeManager::new(
        cfg.clone(),
        agent_upid,
        procfs.clone(),
        Box::new(backend),
        Box::new(resolver),
        reporter,
    ));
    manager.init(cfg.enable_http2_tracing, cfg.disable_self_probing);

    // Status rows land in the agent log until a table exporter claims
    // the stream.
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tick.tick().await;
            for row in status_stream.drain_source() {
                info!(
                    "source-status {} {} {} {}",
                    row.source_connector, row.status, row.context, row.error_message
                );
            }
            for row in status_stream.drain_probe() {
                info!(
                    "probe-status {} {} {} {}",
                    row.tracepoint, row.status, row.error_message, row.info_json
                );
            }
        }
    });

    let scanner = ProcTracker::new(procfs, agent_upid.asid);
    let mut scan_tick = tokio::time::interval(PROC_SCAN_PERIOD);
    info!("hookscope agent running (pid {agent_pid})");

    loop {
        tokio::select! {
            _ = scan_tick.tick() => {
                match scanner.scan() {
                    Ok(snapshot) => {
                        manager.run_deploy_thread(snapshot);
                    }
                    Err(e) => warn!("process scan failed: {e}"),
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("signal handler failed: {e}");
                }
                break;
            }
        }
    }

    info!("shutting down");
    manager.shutdown();
    Ok(())
}
