use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use streamcache::{ProxyCacheConfig, ProxyCacheServer};

struct Args {
    config: Option<PathBuf>,
    urls: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut urls = Vec::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("usage: streamcache [--config PATH] URL...");
                std::process::exit(0);
            }
            _ if arg.starts_with('-') => bail!("Unknown option {}", arg),
            _ => urls.push(arg),
        }
    }

    Ok(Args { config, urls })
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("streamcache=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => ProxyCacheConfig::load_from(path)?,
        None => ProxyCacheConfig::load()?,
    };

    info!("Starting streamcache");
    let server = ProxyCacheServer::builder()
        .config(config)
        .build()
        .await
        .context("Failed to start the cache proxy")?;

    for url in &args.urls {
        let proxied = server.proxy_url(url).await;
        println!("{} -> {}", url, proxied);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Shutting down");
    server.shutdown().await;

    Ok(())
}
