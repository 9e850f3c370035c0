use anyhow::{bail, Result};
use kafka_ha_core::{Scenario, ScenarioOrchestrator, ScenarioReport};
use tracing::info;

use super::OutputFormat;

pub struct RunOptions {
    pub scenarios: Vec<String>,
    pub all: bool,
    pub simulate: bool,
    pub read_back: bool,
    pub format: OutputFormat,
}

pub async fn run(config_path: &str, options: RunOptions) -> Result<()> {
    let config = super::load_config(config_path).await?;

    let scenarios: Vec<Scenario> = if options.all {
        Scenario::ALL.to_vec()
    } else {
        options
            .scenarios
            .iter()
            .map(|name| name.parse())
            .collect::<kafka_ha_core::Result<_>>()?
    };

    let orchestrator = if options.simulate {
        info!("Running {} scenarios against the simulated cluster", scenarios.len());
        let (orchestrator, _cluster) = ScenarioOrchestrator::simulated(&config);
        orchestrator
    } else {
        info!(
            "Running {} scenarios against {}",
            scenarios.len(),
            config.cluster.bootstrap_servers.join(",")
        );
        ScenarioOrchestrator::connect(&config)?
    };
    let orchestrator = orchestrator.with_read_back(options.read_back);

    let reports = orchestrator.run_all(&scenarios).await;

    if !options.format.print_structured(&reports)? {
        for report in &reports {
            print_report_text(report);
        }
    }

    let failed = reports.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        bail!("{} of {} scenarios failed", failed, reports.len());
    }
    Ok(())
}

fn print_report_text(report: &ScenarioReport) {
    println!("══════════════════════════════════════════════════════════════════════");
    println!(" Scenario: {}", report.scenario);
    println!(" Result:   {}", if report.passed { "✓ PASSED" } else { "✗ FAILED" });
    println!("──────────────────────────────────────────────────────────────────────");
    for step in &report.steps {
        println!(
            " {:>8.1}s  {} {:<24} {}",
            step.at_ms as f64 / 1000.0,
            if step.passed { "✓" } else { "✗" },
            step.step.to_string(),
            step.detail.as_deref().unwrap_or("")
        );
    }

    if let Some(write_report) = &report.write_report {
        println!("──────────────────────────────────────────────────────────────────────");
        println!(" Records sent:  {}", write_report.records_sent());
        println!(" Records acked: {}", write_report.records_acked());
        println!(" Send errors:   {}", write_report.counted_send_errors());
        println!(" Ack errors:    {}", write_report.counted_ack_errors());
    }

    if !report.passed {
        println!("──────────────────────────────────────────────────────────────────────");
        if let (Some(step), Some(error)) = (&report.failed_step, &report.error) {
            println!(" Failed at {}: {}", step, error);
        }
        if let Some(description) = &report.last_description {
            println!(
                " Last observed leader {:?}, isr {:?}",
                description.leader.map(|l| l.0),
                description
                    .in_sync_replicas
                    .iter()
                    .map(|r| r.0)
                    .collect::<Vec<_>>()
            );
        }
        if let Some(offsets) = &report.resumed_offsets {
            println!(" Offsets after the outage {:?}", offsets.as_slice());
        }
        if let Some(offsets) = &report.last_offsets {
            println!(" Last observed offsets {:?}", offsets.as_slice());
        }
        if let Some(consistency) = &report.consistency {
            for violation in &consistency.violations {
                println!(" ✗ {}: {}", violation.invariant(), violation);
            }
        }
    }
    println!();
}
