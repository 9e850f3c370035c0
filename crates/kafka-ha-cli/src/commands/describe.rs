use anyhow::Result;
use kafka_ha_core::{ClusterObserver, KafkaCluster, TopicDescription, UnitRef};
use std::sync::Arc;

use super::OutputFormat;

pub async fn run(config_path: &str, unit: Option<u32>, format: OutputFormat) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let cluster = Arc::new(KafkaCluster::new(config.cluster.clone(), config.topic.clone()));
    let observer = ClusterObserver::new(cluster, config.observer.clone());

    let target = unit.map(|index| UnitRef::new(config.cluster.app_name.clone(), index));
    let description = observer
        .describe_topic(&config.topic.name, target.as_ref())
        .await?;

    if !format.print_structured(&description)? {
        print_description_text(&description, target.as_ref());
    }
    Ok(())
}

fn print_description_text(description: &TopicDescription, via: Option<&UnitRef>) {
    let ids = |set: &std::collections::BTreeSet<kafka_ha_core::ReplicaId>| {
        set.iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("Topic:    {}", description.topic);
    if let Some(unit) = via {
        println!("Asked:    {}", unit);
    }
    println!(
        "Leader:   {}",
        description
            .leader
            .map_or_else(|| "none".to_string(), |l| l.to_string())
    );
    println!("ISR:      {}", ids(&description.in_sync_replicas));
    println!("Replicas: {}", ids(&description.replicas));
}
