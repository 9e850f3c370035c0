use anyhow::Result;
use tracing::info;

pub async fn run(config_path: &str) -> Result<()> {
    info!("Validating configuration: {}", config_path);
    let config = super::load_config(config_path).await?;

    println!("✓ Configuration is valid");
    println!("  Bootstrap servers: {}", config.cluster.bootstrap_servers.join(", "));
    println!(
        "  Topic:             {} ({} partitions, replication factor {})",
        config.topic.name, config.topic.partitions, config.topic.replication_factor
    );
    println!(
        "  Units:             {}/0..{} (broker ids from {})",
        config.cluster.app_name, config.cluster.replica_count, config.cluster.broker_id_offset
    );
    match &config.control_plane {
        Some(control_plane) => println!("  Control plane:     namespace {}", control_plane.namespace),
        None => println!("  Control plane:     none (only --simulate runs are possible)"),
    }
    Ok(())
}
