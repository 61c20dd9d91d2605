// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use http::HeaderMap;
use std::sync::Arc;
use tracing::{info, warn};

use cli::{Args, Command};
use kubemcp::catalog::OperationRegistry;
use kubemcp::config::ConfigStore;
use kubemcp::events::{EventBus, GatewayEvent};
use kubemcp::gateway::{Gateway, RequestScope};
use kubemcp::kubernetes::{AccessAttributes, KubeClientFactory};
use kubemcp::logging::init_logging;
use kubemcp::reload::ReloadTrigger;

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (aws-lc-rs)
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let args = Args::parse();

    let store = ConfigStore::open(args.config_sources())
        .await
        .context("Failed to load configuration")?;

    let log = init_logging(store.current_snapshot().merged.log_level, args.log_file);

    let events = Arc::new(EventBus::new());
    let gateway = Gateway::open(
        store,
        Arc::new(KubeClientFactory),
        OperationRegistry::with_defaults(),
        args.context.clone(),
        events,
    )
    .await?
    .with_log_level_hook(Box::new(move |level| log.set_level(level)));

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(Arc::new(gateway)).await,
        Command::Contexts => {
            for ctx in gateway.current().contexts.list_contexts().await {
                println!(
                    "{} {:<30} {:<40} {}",
                    if ctx.is_default { "*" } else { " " },
                    ctx.name,
                    ctx.server.as_deref().unwrap_or("-"),
                    ctx.namespace.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
        Command::Resolve { api_version, kind } => {
            let scope = local_scope(&gateway)?;
            let bundle = scope.bundle().await?;
            let resolved = scope
                .run(bundle.mapper().rest_mapping(&api_version, &kind))
                .await?;
            println!(
                "{} {} -> {} ({})",
                resolved.api_version(),
                resolved.kind(),
                resolved.plural(),
                if resolved.namespaced { "namespaced" } else { "cluster" },
            );
            Ok(())
        }
        Command::CanI {
            verb,
            resource,
            group,
            namespace,
            name,
        } => {
            let scope = local_scope(&gateway)?;
            let bundle = scope.bundle().await?;
            let attrs = AccessAttributes::new(&verb, &group, &resource)
                .in_namespace(namespace.as_deref())
                .named(name.as_deref());
            if !scope.run(bundle.can_use(&attrs)).await? {
                println!("no");
                anyhow::bail!("{} {} is not permitted", verb, resource);
            }
            println!("yes");
            Ok(())
        }
        Command::Config => {
            print!("{}", gateway.current().config().to_toml()?);
            Ok(())
        }
        Command::Operations => {
            for name in gateway.current().operations.names() {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

/// Scope for commands issued from the local terminal
fn local_scope(gateway: &Gateway) -> Result<RequestScope> {
    Ok(gateway.begin_request(&HeaderMap::new(), None, None)?)
}

async fn serve(gateway: Arc<Gateway>) -> Result<()> {
    let mut events = gateway.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                GatewayEvent::ReloadFailed { error } => {
                    warn!(error = %error, "Keeping previous configuration")
                }
                GatewayEvent::ContextSwitched { from, to } => {
                    info!(from = %from, to = %to, "Default context switched")
                }
                _ => {}
            }
        }
    });

    let (reload, trigger) = ReloadTrigger::new(gateway.clone()).spawn();

    let generation = gateway.current();
    info!(
        version = generation.version(),
        default_context = %generation.contexts.default_context().await,
        operations = generation.operations.len(),
        "Gateway ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")?;
    info!("Shutting down");

    drop(reload);
    let _ = trigger.await;
    Ok(())
}
