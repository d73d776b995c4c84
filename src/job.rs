//! Submit, poll and retrieve for asynchronous invocations.
//!
//! Each submission writes one request object under a fresh random key and is
//! answered by one output object at a platform-chosen key. Both are deleted,
//! best effort, once the result has been downloaded.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use plume_core::InvocationRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{JobConfig, StorageConfig};
use crate::extract::extract_png;
use crate::runtime::AsyncInvoker;
use crate::storage::{ObjectStore, S3Location, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub request_id: Uuid,
    pub inference_id: String,
    pub input: S3Location,
    pub output: S3Location,
    pub failure: Option<S3Location>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Fire-and-forget: the request was queued and nothing was awaited.
    Submitted(SubmittedJob),
    Completed { job: SubmittedJob, image: PathBuf },
    /// The platform keeps working on the job; only the local wait stopped.
    TimedOut(SubmittedJob),
    Cancelled(SubmittedJob),
}

/// Result of deleting a job's request and output objects.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub failures: Vec<(S3Location, StorageError)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct JobClient<S, R> {
    store: S,
    runtime: R,
    endpoint_name: String,
    storage: StorageConfig,
    config: JobConfig,
}

impl<S: ObjectStore, R: AsyncInvoker> JobClient<S, R> {
    pub fn new(
        store: S,
        runtime: R,
        endpoint_name: impl Into<String>,
        storage: StorageConfig,
        config: JobConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            endpoint_name: endpoint_name.into(),
            storage,
            config,
        }
    }

    /// Uploads the request under a fresh key and queues the invocation.
    pub async fn submit(&self, request: &InvocationRequest) -> Result<SubmittedJob> {
        let request_id = Uuid::new_v4();
        let input = S3Location::new(
            &self.storage.bucket,
            format!("{}/prompt-{request_id}.json", self.storage.input_prefix),
        );

        let body = serde_json::to_vec(request).context("failed to serialize request")?;
        self.store
            .put_object(&input, Bytes::from(body), "application/json")
            .await
            .with_context(|| format!("failed to upload request to {input}"))?;
        info!("Uploaded input to: {input}");

        let invocation = self
            .runtime
            .invoke_async(&self.endpoint_name, &input, self.config.invocation_timeout)
            .await
            .with_context(|| format!("failed to invoke endpoint {}", self.endpoint_name))?;
        info!("Inference ID: {}", invocation.inference_id);
        info!("Output will be available at: {}", invocation.output_location);

        Ok(SubmittedJob {
            request_id,
            inference_id: invocation.inference_id,
            input,
            output: invocation.output_location,
            failure: invocation.failure_location,
        })
    }

    /// Checks for the output object once per poll interval.
    ///
    /// Only "not found" keeps the loop going; any other storage error ends it
    /// with `Err`. Running out of polls is not an error.
    pub async fn wait_for_output(
        &self,
        job: &SubmittedJob,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        let max_polls = self.config.max_polls();
        let mut polls = 0u32;
        info!("Waiting for result…");

        loop {
            match self.store.head_object(&job.output).await {
                Ok(()) => return Ok(WaitOutcome::Ready),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to check {}", job.output))
                }
            }

            polls += 1;
            if max_polls.is_some_and(|max| polls >= max) {
                return Ok(WaitOutcome::TimedOut);
            }

            tokio::select! {
                () = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
            let waited = self.config.poll_interval * polls;
            info!("Generating for {} seconds…", waited.as_secs());
        }
    }

    /// Downloads the result, then removes both job objects.
    pub async fn retrieve(&self, job: &SubmittedJob) -> Result<Bytes> {
        let bytes = self
            .store
            .get_object(&job.output)
            .await
            .with_context(|| format!("failed to download {}", job.output))?;
        self.cleanup(job).await;
        Ok(bytes)
    }

    /// Deletes the output and input objects independently; failures are logged, never raised.
    pub async fn cleanup(&self, job: &SubmittedJob) -> CleanupReport {
        let mut report = CleanupReport::default();
        for location in [&job.output, &job.input] {
            match self.store.delete_object(location).await {
                Ok(()) => info!("Freed temporary object: {location}"),
                Err(e) => {
                    warn!("Error deleting {location}: {e:#}");
                    report.failures.push((location.clone(), e));
                }
            }
        }
        report
    }

    /// The whole round trip. With `download` off this returns right after submission.
    pub async fn run(
        &self,
        request: &InvocationRequest,
        download: bool,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        let job = self.submit(request).await?;
        if !download {
            info!("Skipping download of output file.");
            return Ok(JobOutcome::Submitted(job));
        }

        match self.wait_for_output(&job, cancel).await? {
            WaitOutcome::Ready => {}
            WaitOutcome::TimedOut => {
                match &job.failure {
                    Some(failure) => warn!("Timeout waiting for result; failures land at {failure}"),
                    None => warn!("Timeout waiting for result."),
                }
                return Ok(JobOutcome::TimedOut(job));
            }
            WaitOutcome::Cancelled => {
                warn!("Stopped waiting for {}", job.inference_id);
                return Ok(JobOutcome::Cancelled(job));
            }
        }

        let result = self.retrieve(&job).await?;
        let image = self.save_image(&result)?;
        Ok(JobOutcome::Completed { job, image })
    }

    fn save_image(&self, result: &[u8]) -> Result<PathBuf> {
        let mut raw = tempfile::Builder::new()
            .prefix("output-")
            .suffix(".bin")
            .tempfile()
            .context("failed to create temporary result file")?;
        raw.write_all(result)
            .and_then(|()| raw.flush())
            .context("failed to write temporary result file")?;
        debug!(path = %raw.path().display(), "stored raw result");

        let name = format!("output-{}", Uuid::new_v4());
        match extract_png(raw.path(), &self.config.output_dir, &name) {
            Ok(image) => Ok(image),
            // both objects are gone from the bucket by now; the local copy is all that is left
            Err(e) => {
                let (_, kept) = raw.keep().context("failed to keep the raw result file")?;
                Err(e.context(format!("failed to extract result; raw result kept at {}", kept.display())))
            }
        }
    }
}
