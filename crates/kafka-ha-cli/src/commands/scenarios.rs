use anyhow::Result;
use kafka_ha_core::{Scenario, ScenarioTimings};

pub async fn run(config_path: Option<&str>) -> Result<()> {
    let timings = match config_path {
        Some(path) => super::load_config(path).await?.timings,
        None => ScenarioTimings::default(),
    };

    println!("{:<22} {:>8}  DESCRIPTION", "SCENARIO", "WAITS");
    for scenario in Scenario::ALL {
        let plan = scenario.plan(&timings);
        println!(
            "{:<22} {:>7}s  {}",
            scenario.name(),
            plan.total_wait().as_secs(),
            scenario.summary()
        );
    }
    Ok(())
}
