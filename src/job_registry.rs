use crate::BackgroundJob;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Type-erased runner for one job type: deserializes the payload, runs the
/// job, and serializes its output.
pub(crate) type RunTaskFn<Context> =
    dyn Fn(Context, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, Arc<RunTaskFn<Context>>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let run_task_fn: Arc<RunTaskFn<Context>> = Arc::new(|ctx: Context, payload: Value| {
            async move {
                let job: J = serde_json::from_value(payload)?;
                let output = job.run(ctx).await?;
                Ok::<_, anyhow::Error>(serde_json::to_value(output)?)
            }
            .boxed()
        });
        self.entries.insert(J::JOB_TYPE.to_string(), run_task_fn);
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<Arc<RunTaskFn<Context>>> {
        self.entries.get(job_type).cloned()
    }

    pub(crate) fn job_types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Double {
        value: i64,
    }

    impl BackgroundJob for Double {
        const JOB_TYPE: &'static str = "double";
        type Context = i64;
        type Output = i64;

        async fn run(&self, offset: Self::Context) -> anyhow::Result<Self::Output> {
            Ok(self.value * 2 + offset)
        }
    }

    #[tokio::test]
    async fn registered_jobs_are_dispatched_by_type() -> anyhow::Result<()> {
        let mut registry = JobRegistry::default();
        assert!(registry.is_empty());
        registry.register::<Double>();

        assert_eq!(registry.job_types(), vec!["double".to_string()]);
        assert!(registry.get("triple").is_none());

        let run = registry.get("double").ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(run(1, json!({"value": 20})).await?, json!(41));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_payloads_are_errors() -> anyhow::Result<()> {
        let mut registry = JobRegistry::default();
        registry.register::<Double>();

        let run = registry.get("double").ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert!(run(0, json!({"value": "twenty"})).await.is_err());
        Ok(())
    }
}
