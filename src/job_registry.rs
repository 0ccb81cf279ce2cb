use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::queue_job::QueueJob;

type RunTaskFn<Context> =
    dyn Fn(Context, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Maps job type names to their deserialization + execution glue.
pub(crate) struct JobRegistry<Context> {
    job_types: HashMap<&'static str, Arc<RunTaskFn<Context>>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            job_types: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            job_types: self.job_types.clone(),
        }
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: QueueJob<Context = Context>>(&mut self) {
        self.job_types.insert(J::JOB_TYPE, Arc::new(run_task::<J>));
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&Arc<RunTaskFn<Context>>> {
        self.job_types.get(job_type)
    }

    pub(crate) fn job_types(&self) -> Vec<String> {
        self.job_types.keys().map(|s| (*s).to_string()).collect()
    }
}

fn run_task<J: QueueJob>(ctx: J::Context, data: Value) -> BoxFuture<'static, anyhow::Result<()>> {
    Box::pin(async move {
        let job: J = serde_json::from_value(data)
            .map_err(|err| anyhow!("Failed to deserialize job data: {err}"))?;
        job.run(ctx).await
    })
}
