use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use zonal_gossip::config::AgentConfig;
use zonal_gossip::crypto::{Encrypter, PlainText, ZoneKeyring};
use zonal_gossip::membership::handlers::router;
use zonal_gossip::membership::service::MembershipService;
use zonal_gossip::membership::types::NodeState;
use zonal_gossip::zone::ZoneTopology;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!(
            "Usage: {} [--config <file.json>] [--bind <addr:port>] [--seed <addr:port>]... \
             [--zone <name>] [--proxy] [--name <name>] [--data-dir <dir>] [--bootstrap] [--detect]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:6768 --bootstrap", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:6769 --seed 127.0.0.1:6768",
            args[0]
        );

        std::process::exit(1);
    }

    let config = AgentConfig::from_args(&args)?;

    tracing::info!("Starting agent {} on {} (zone {})", config.name, config.bind_addr, config.zone);
    if !config.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", config.seeds);
    } else if config.bootstrap {
        tracing::info!("Starting as cluster bootstrap");
    }

    // 1. Zones and datagram protection:
    let topology = Arc::new(ZoneTopology::from_zones(config.zones.clone()));
    if !config.zones.is_empty() && !topology.has_zone(&config.zone) {
        tracing::warn!("Local zone {} is not declared in the zone list", config.zone);
    }

    let encrypter: Arc<dyn Encrypter> = if config.encryption_keys.is_empty() {
        Arc::new(PlainText)
    } else {
        tracing::info!("Signing gossip for {} zone(s)", config.encryption_keys.len());
        Arc::new(ZoneKeyring::new(config.encryption_keys.clone()))
    };

    // 2. Membership (UDP gossip):
    let membership = MembershipService::new(config, topology, encrypter).await?;
    let http_addr: SocketAddr = membership.local_addr()?;
    tracing::info!("Node ID: {}", membership.uuid());

    // 3. HTTP Router, on the same port as gossip:
    let app = router(membership.clone());

    // 4. Spawn membership service:
    membership.clone().start().await;

    // 5. Spawn stats reporter:
    let stats_service = membership.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            interval.tick().await;
            if stats_service.is_stopping() {
                break;
            }
            tracing::info!(
                "Cluster stats: {} alive, {} suspect, {} dead, {} leave",
                stats_service.count(Some(NodeState::Alive), None),
                stats_service.count(Some(NodeState::Suspect), None),
                stats_service.count(Some(NodeState::Dead), None),
                stats_service.count(Some(NodeState::Leave), None),
            );
        }
    });

    // 6. Start HTTP server:
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let stopped = membership.clone();
    tokio::select! {
        served = axum::serve(listener, app) => served?,
        _ = stopped.wait_stopped() => {}
        _ = tokio::signal::ctrl_c() => {
            membership.stop();
        }
    }

    Ok(())
}
