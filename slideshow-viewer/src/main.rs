//! Slideshow viewer — scripted session against an in-process sync server.
//!
//! Configuration comes from the environment (`SLIDESHOW_DB_ID`,
//! `SLIDESHOW_SYNC_MODE`, `RUST_LOG`). Two viewers share one server so each
//! upload and deletion is seen arriving at the other side.

mod slideshow;

use std::sync::Arc;

use log::{error, info};
use slideshow_sync::{MemoryServer, ServerConfig, SyncClient, SyncConfig, SyncError, SyncedArray};
use tokio::time::{sleep, timeout, Duration};

use slideshow::Slideshow;

const PICTURES: &[(&str, &str)] = &[
    ("harbour.jpg", "data:image/jpeg;base64,/9j/4AAQSkZJRgABAQ=="),
    ("lighthouse.jpg", "data:image/jpeg;base64,/9j/4AAQSkZJRgABAg=="),
    ("dunes.png", "data:image/png;base64,iVBORw0KGgoAAAANSUhEUg=="),
];

/// Wait until `show` holds `len` pictures.
async fn settle(show: &Slideshow, len: usize) -> bool {
    timeout(Duration::from_secs(2), async {
        while show.pictures().len() != len {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

fn render(name: &str, show: &Slideshow) {
    if show.take_dirty() {
        info!("[{name}] {} | strip: {:?}", show.caption(), show.thumbnails());
    }
}

async fn run(config: SyncConfig) -> Result<(), SyncError> {
    let server = MemoryServer::new(ServerConfig::default());

    let mut viewers = Vec::new();
    for name in ["projector", "laptop"] {
        let client = SyncClient::new(config.clone(), Arc::new(server.transport()));
        let pictures = client.synchronize_with("pictures", config.default_mode);
        pictures.ready().await?;
        viewers.push((name, Slideshow::new(pictures)));
    }
    let (_, projector) = &viewers[0];
    let (_, laptop) = &viewers[1];

    for (name, data_url) in PICTURES {
        laptop.add_picture(name, data_url)?.acknowledged().await?;
    }
    if !settle(projector, PICTURES.len()).await {
        error!("projector never saw the uploads");
    }
    for (name, show) in &viewers {
        render(name, show);
    }

    projector.next();
    projector.next();
    projector.previous();
    render("projector", projector);

    projector.remove_current()?.acknowledged().await?;
    settle(laptop, PICTURES.len() - 1).await;
    for (name, show) in &viewers {
        render(name, show);
    }

    info!("final state: {}", laptop.pictures());
    let stats = server.stats();
    info!(
        "server handled {} requests ({} failed), published {} notifications",
        stats.requests, stats.failed_requests, stats.bus.notifications_published
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("bad configuration: {e}");
            std::process::exit(2);
        }
    };
    info!("Slideshow viewer: database {}, {} mode", config.database_id, config.default_mode);

    if let Err(e) = run(config).await {
        error!("session failed: {e}");
        std::process::exit(1);
    }
}
