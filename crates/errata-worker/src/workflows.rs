//! Workflow executors: sequences of activity calls with per-activity
//! deadlines.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::queue::{Executor, TaskType};

pub const MATCHER_WORKFLOW: TaskType = TaskType(1);
pub const DEFUNCT_WORKFLOW: TaskType = TaskType(2);

/// Per-activity deadlines, supplied by the orchestration layer.
const LIST_PRODUCTS_DEADLINE: Duration = Duration::from_secs(20);
const MATCH_PRODUCT_DEADLINE: Duration = Duration::from_secs(12 * 60 * 60);
const BLOCK_PRODUCT_DEADLINE: Duration = Duration::from_secs(12 * 60 * 60);

/// Shared handles the workflow executors run against.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: sqlx::PgPool,
    pub client: reqwest::Client,
    pub config: Arc<matcher::MatcherConfig>,
}

/// MatcherWorkflow lists the products with mirrors (optionally
/// filtered) and matches each in sequence. A product failure aborts
/// only that product.
pub struct MatcherWorkflow(pub WorkerContext);

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct MatcherWorkflowParams {
    #[serde(default)]
    pub product_ids: Option<Vec<i64>>,
}

impl Executor for MatcherWorkflow {
    const TASK_TYPE: TaskType = MATCHER_WORKFLOW;

    type Params = MatcherWorkflowParams;

    fn deadline(&self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    async fn execute(&self, params: Self::Params) -> anyhow::Result<()> {
        let WorkerContext {
            pool,
            client,
            config,
        } = &self.0;

        let product_ids = tokio::time::timeout(
            LIST_PRODUCTS_DEADLINE,
            matcher::list_products_with_mirrors(pool),
        )
        .await
        .context("listing products timed out")??;

        let product_ids: Vec<i64> = match &params.product_ids {
            Some(filter) => product_ids
                .into_iter()
                .filter(|id| filter.contains(id))
                .collect(),
            None => product_ids,
        };

        for product_id in product_ids {
            let matched = tokio::time::timeout(
                MATCH_PRODUCT_DEADLINE,
                matcher::match_product(product_id, config, client, pool),
            )
            .await;
            match matched {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(
                        product_id,
                        err = format!("{err:#}"),
                        "matching failed for product"
                    );
                }
                Err(_elapsed) => {
                    tracing::error!(product_id, "matching timed out for product");
                }
            }
        }
        Ok(())
    }
}

/// DefunctWorkflow blocks a defunct product's remaining candidate
/// advisories.
pub struct DefunctWorkflow(pub WorkerContext);

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct DefunctWorkflowParams {
    pub product_id: i64,
}

impl Executor for DefunctWorkflow {
    const TASK_TYPE: TaskType = DEFUNCT_WORKFLOW;

    type Params = DefunctWorkflowParams;

    fn deadline(&self) -> Duration {
        BLOCK_PRODUCT_DEADLINE
    }

    async fn execute(&self, params: Self::Params) -> anyhow::Result<()> {
        let WorkerContext { pool, config, .. } = &self.0;
        matcher::block_unmatched_for_product(params.product_id, config, pool).await
    }
}
