use clap::Parser;
use common::metrics::process_unix::ProcessRecorder;
use common::ShutdownMessage;
use proxy::config::Config;
use proxy::masking::rules::{load_rules, RuleSet};
use proxy::server::auth::authenticator::ProxyAuthenticator;
use proxy::server::proxy_cli_args::ProxyServerArgs;
use proxy::server::router_server::RouterDrivenServer;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::sync::watch::Receiver;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("ProxySrv receive ctrl_c signal  {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg =  format!("ProxySrv receive terminate signal  {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

fn start_metrics(
    proxy_config: &ProxyServerArgs,
    runtime: &Runtime,
    shutdown_rx: &Receiver<ShutdownMessage>,
) {
    if proxy_config.enable_metrics {
        common::metrics::init_metrics_context();
        let mut process_recorder = ProcessRecorder::new(
            common::metrics::common_labels().clone(),
            shutdown_rx.clone(),
        );
        runtime.spawn(async move {
            process_recorder.start_auto_collect().await;
        });
    }
}

/// Loads the router config (§6) from `--config`, falling back to
/// defaults when no path was given.
fn load_config(proxy_config: &ProxyServerArgs) -> Config {
    match &proxy_config.config {
        Some(path) => Config::load(Path::new(path)).unwrap_or_else(|e| {
            warn!("ProxySrv failed to parse config {path:?}, using defaults: {e:?}");
            Config::default()
        }),
        None => Config::default(),
    }
}

/// Loads the masking ruleset from `--masking-rules`. A missing path
/// means masking runs disabled; a malformed file is a hard error since
/// an operator asked for rules that never took effect.
fn load_masking_rules(proxy_config: &ProxyServerArgs) -> RuleSet {
    match &proxy_config.masking_rules {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .unwrap_or_else(|e| panic!("cannot read masking rules {path:?}: {e:?}"));
            match load_rules(&text) {
                Ok(rules) => RuleSet::new(rules),
                Err(e) => panic!("invalid masking rules {path:?}: {e:?}"),
            }
        }
        None => RuleSet::default(),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proxy_config = ProxyServerArgs::parse();
    let log_level_string = proxy_config
        .log_level
        .clone()
        .unwrap_or("DEBUG".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("DEBUG,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse().unwrap())
        .add_directive("h2=INFO".parse().unwrap())
        .add_directive("tower=INFO".parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let works = proxy_config.works;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("RWSPLIT_PROXY")
        .worker_threads(works)
        .build()?;

    info!("ProxySrv running config args={:?}", proxy_config);
    let router_config = Arc::new(load_config(&proxy_config));
    let masking_rules = load_masking_rules(&proxy_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);
    start_metrics(&proxy_config, &runtime, &shutdown_rx);

    runtime.block_on(async {
        let master_addr = proxy_config.master_addr().map(str::to_string);
        let slave_addrs: Vec<String> = proxy_config
            .slave_addrs()
            .into_iter()
            .map(str::to_string)
            .collect();
        if master_addr.is_none() && slave_addrs.is_empty() {
            panic!("failed to build backend topology: no backend addresses configured");
        }

        let proxy_srv = RouterDrivenServer::new(
            router_config,
            master_addr,
            slave_addrs,
            ProxyAuthenticator,
        )
        .with_masking_rules(masking_rules);

        let port = proxy_config.port;
        let tcp_listener = TcpListener::bind(format!("0.0.0.0:{port}")).await.unwrap();
        let proxy_srv_arc = Arc::new(proxy_srv);
        let serve_handle = {
            let proxy_srv_arc = Arc::clone(&proxy_srv_arc);
            runtime.spawn(async move {
                if let Err(e) = proxy_srv_arc.serve(tcp_listener).await {
                    error!("ProxySrv accept loop ended with error {e:?}");
                }
            })
        };

        let shutdown_msg = shutdown_signal().await;
        shutdown_tx.send(shutdown_msg.clone()).unwrap();
        serve_handle.abort();
        Ok(())
    })
}
