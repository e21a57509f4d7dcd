//! Recipe execution and metrics.

mod metrics;
mod stages;

pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use stages::{Recipe, RecipeStats, StageConfig, ZarrTarget};
