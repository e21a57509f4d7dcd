//! The seam between a recipe and the service that serves its inputs.

use super::dap::Subset;
use crate::dataset::Dataset;
use crate::transform::DatasetSchema;
use anyhow::Result;
use async_trait::async_trait;

/// Opens remote inputs as schemas (metadata only) or full datasets.
#[async_trait]
pub trait DatasetOpener: Send + Sync {
    /// Structure of the input after subsetting, without fetching values.
    async fn open_schema(&self, url: &str, subset: &Subset) -> Result<DatasetSchema>;

    /// The input's values after subsetting, with coordinates inferred.
    async fn open_dataset(&self, url: &str, subset: &Subset) -> Result<Dataset>;
}

/// Serves datasets from memory, keyed by URL.
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use crate::io::dap::DapError;
    use anyhow::Context;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryOpener {
        datasets: HashMap<String, Dataset>,
        /// Remaining failures to inject per URL before succeeding
        failures: Mutex<HashMap<String, usize>>,
        missing: Mutex<HashSet<String>>,
        pub opens: AtomicUsize,
    }

    impl MemoryOpener {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&mut self, url: impl Into<String>, ds: Dataset) {
            self.datasets.insert(url.into(), ds);
        }

        /// Fail the next `n` data opens of `url`.
        pub fn fail_times(&self, url: &str, n: usize) {
            if let Ok(mut failures) = self.failures.lock() {
                failures.insert(url.to_string(), n);
            }
        }

        /// Answer every data open of `url` with an HTTP 404.
        pub fn not_found(&self, url: &str) {
            if let Ok(mut missing) = self.missing.lock() {
                missing.insert(url.to_string());
            }
        }

        fn lookup(&self, url: &str) -> Result<&Dataset> {
            self.datasets
                .get(url)
                .with_context(|| format!("No dataset registered for {}", url))
        }
    }

    #[async_trait]
    impl DatasetOpener for MemoryOpener {
        async fn open_schema(&self, url: &str, _subset: &Subset) -> Result<DatasetSchema> {
            Ok(DatasetSchema::from_dataset(self.lookup(url)?)?)
        }

        async fn open_dataset(&self, url: &str, _subset: &Subset) -> Result<Dataset> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.missing.lock().is_ok_and(|missing| missing.contains(url)) {
                return Err(DapError::Status {
                    url: format!("{}.dods", url),
                    status: 404,
                }
                .into());
            }
            if let Ok(mut failures) = self.failures.lock() {
                if let Some(n) = failures.get_mut(url) {
                    if *n > 0 {
                        *n -= 1;
                        anyhow::bail!("injected failure for {}", url);
                    }
                }
            }
            Ok(self.lookup(url)?.clone())
        }
    }
}
