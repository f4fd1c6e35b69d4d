//! Status command implementation.

use super::StoreArgs;
use edgesync_engine::{
    EngineConfig, FileHistoryLog, HealthReport, HistoryLog, StatsCollector, StoreHealth,
};
use edgesync_protocol::EntityType;

/// Runs the status command.
///
/// Reads the history without taking the state lock, so it works next to a
/// running server.
pub fn run(stores: &StoreArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::new();
    let opened = stores.open()?;
    let history = FileHistoryLog::open(&stores.state_dir)?;
    let stats = StatsCollector::new(opened.primary, opened.replica, config.entity_types.clone());
    let primary = stats.primary();
    let replica = stats.replica();
    let report = HealthReport::new(
        primary.clone(),
        replica.clone(),
        history.recent_runs(config.recent_runs_limit),
    );

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            print_store("Primary", &primary);
            print_store("Replica", &replica);
            print_text(&report);
        }
    }
    Ok(())
}

fn print_text(report: &HealthReport) {
    println!("Converged: {}", report.converged());

    println!("Recent runs:");
    if report.recent_runs.is_empty() {
        println!("  (none)");
    }
    for run in &report.recent_runs {
        println!(
            "  {} {:<15} {:<13} {:<9} +{} ~{} -{} !{}",
            run.finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            run.status.as_str(),
            run.direction.as_str(),
            format!("{:?}", run.trigger).to_lowercase(),
            run.counts.added,
            run.counts.updated,
            run.counts.deleted,
            run.counts.conflicted
        );
    }
}

fn print_store(label: &str, health: &StoreHealth) {
    if !health.connected {
        println!(
            "{label}: disconnected ({})",
            health.error.as_deref().unwrap_or("no answer")
        );
        return;
    }
    println!("{label}: connected");
    if let Some(snapshot) = &health.stats {
        for entity_type in EntityType::ALL {
            println!("  {:<14} {}", entity_type.as_str(), snapshot.count(entity_type));
        }
        for (role, n) in &snapshot.users_by_role {
            println!("    {role:<12} {n}");
        }
    }
}
