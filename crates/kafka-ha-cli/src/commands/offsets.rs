use anyhow::Result;
use kafka_ha_core::{ClusterObserver, KafkaCluster, UnitRef};
use std::sync::Arc;

use super::OutputFormat;

pub async fn run(config_path: &str, unit: Option<u32>, format: OutputFormat) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let cluster = Arc::new(KafkaCluster::new(config.cluster.clone(), config.topic.clone()));
    let observer = ClusterObserver::new(cluster, config.observer.clone());

    let target = unit.map(|index| UnitRef::new(config.cluster.app_name.clone(), index));
    let snapshot = observer
        .read_offsets(&config.topic.name, target.as_ref())
        .await?;

    if !format.print_structured(&snapshot)? {
        println!("{:<10} {:>14}", "PARTITION", "HIGH WATERMARK");
        for (partition, offset) in snapshot.as_slice().iter().enumerate() {
            println!("{:<10} {:>14}", partition, offset);
        }
        println!("{:<10} {:>14}", "total", snapshot.total());
    }
    Ok(())
}
