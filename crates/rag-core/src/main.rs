use anyhow::Result;
use tracing::info;

use rag_core::services::resilience::{MemoryProbe, SystemMemoryProbe};
use rag_core::utils::logger::init_logger;
use rag_core::Settings;

/// Validates the layered configuration and reports this host's memory
/// baseline, so a deployment can be checked before traffic reaches it.
fn main() -> Result<()> {
    init_logger()?;

    info!("Checking rag-core configuration...");
    let settings = Settings::load()?;
    info!("Configuration loaded");

    let sample = SystemMemoryProbe::new().sample();
    info!(
        "Memory baseline: {} MB ({:.2}% of host), warning at {:.0}%, critical at {:.0}%",
        sample.process_mb(),
        sample.usage_percent(),
        settings.memory.warning_threshold,
        settings.memory.critical_threshold
    );

    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
