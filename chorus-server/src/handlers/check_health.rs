use std::collections::BTreeMap;

use async_trait::async_trait;
use chorus_core::{
    commands::{CommandContext, CommandHandler},
    health::HealthCheckEngine,
};
use serde_json::{Value, json};

pub const CHECK_HEALTH: &str = "CheckHealth";

/// Re-runs every health check and reports how many landed at each
/// severity.
#[derive(Debug, Clone)]
pub struct CheckHealthHandler {
    engine: HealthCheckEngine,
}

impl CheckHealthHandler {
    pub fn new(engine: HealthCheckEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl CommandHandler for CheckHealthHandler {
    fn name(&self) -> &str {
        CHECK_HEALTH
    }

    async fn execute(&self, ctx: CommandContext) -> anyhow::Result<Value> {
        ctx.set_message("Evaluating health checks").await;
        let results = self.engine.evaluate_all().await;

        let mut by_severity: BTreeMap<&str, usize> = BTreeMap::new();
        for result in &results {
            *by_severity.entry(result.severity.as_str()).or_default() += 1;
        }
        tracing::debug!(
            target: "handlers::check_health",
            command_id = %ctx.id(),
            evaluated = results.len(),
            "health checks evaluated"
        );

        Ok(json!({
            "evaluated": results.len(),
            "bySeverity": by_severity,
            "overall": self.engine.overall_severity(),
        }))
    }
}
