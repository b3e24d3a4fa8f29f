use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::lodestone::{
    admin, config,
    firewall::FirewallClient,
    identity::IdentityResolver,
    logging, net, proxy,
    registry::ConnectionRegistry,
    reporter::ManagerReporter,
    routes::RouteTable,
    session, telemetry,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _log_guard = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        proxy_addr = %cfg.proxy_addr,
        api_addr = %cfg.api_addr,
        routes_file = %cfg.routes_file.display(),
        manager = !cfg.manager_address.is_empty(),
        "lodestone: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let routes = Arc::new(RouteTable::load(&cfg.routes_file)?);
    let registry = Arc::new(ConnectionRegistry::new());

    let http = reqwest::Client::builder()
        .timeout(cfg.http_timeout)
        .build()
        .context("build http client")?;
    let identity = Arc::new(IdentityResolver::new(http.clone(), cfg.identity.clone()));
    let firewall = FirewallClient::new(http.clone(), &cfg.manager_address, &cfg.manager_api_key)
        .map(Arc::new);
    let reporter =
        ManagerReporter::new(http, &cfg.manager_address, &cfg.manager_api_key).map(Arc::new);
    if firewall.is_none() {
        tracing::info!("manager: address or api key unset; firewall and reporting disabled");
    }

    let session_opts = Arc::new(session::SessionOptions {
        routes: routes.clone(),
        registry: registry.clone(),
        identity,
        firewall,
        reporter,
        initial_grace: cfg.timeouts.initial_grace,
        coalesce_idle: cfg.timeouts.coalesce_idle,
        max_initial_bytes: cfg.max_initial_bytes,
        dial_timeout: cfg.upstream_dial_timeout,
        debug_marker: cfg.debug_marker.clone(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let api_addr: SocketAddr = net::normalize_bind_addr(&cfg.api_addr)
            .parse()
            .with_context(|| format!("invalid api_addr: {}", cfg.api_addr))?;
        let state = admin::AdminState {
            routes,
            registry,
            prom,
            api_key: cfg.api_key.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve(api_addr, state, shutdown).await });
    }

    {
        let listen_addr = cfg.proxy_addr.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { proxy::serve_tcp(listen_addr, session_opts, shutdown).await });
    }

    // Wait for a shutdown signal or an unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks; only force things down if something ignores the signal.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
