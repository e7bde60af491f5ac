//! `deltaguard-server watch`: follows a running server's event streams.

use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use deltaguard_core::multiplexer::{
    ConnectionMultiplexer, EventSourceConnector, MultiplexerConfig, StreamListener,
};
use deltaguard_core::types::JobId;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    /// Base URL of the server, e.g. http://localhost:3000
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    pub url: String,

    /// Jobs whose progress streams should be followed as well
    #[arg(value_name = "JOB_ID")]
    pub jobs: Vec<JobId>,
}

impl WatchArgs {
    /// The job list stream first, then one progress stream per job.
    pub fn targets(&self) -> Vec<String> {
        let base = self.url.trim_end_matches('/');
        std::iter::once(format!("{base}/jobs/events"))
            .chain(
                self.jobs
                    .iter()
                    .map(|job| format!("{base}/jobs/{job}/events")),
            )
            .collect()
    }
}

/// Prints every event until ctrl-c. Streams beyond `config.max_open` wait
/// for a free slot.
pub async fn run_watch(args: WatchArgs, config: MultiplexerConfig) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let mux = ConnectionMultiplexer::new(Arc::new(EventSourceConnector::new(client)), config);
    let mut streams = JoinSet::new();

    for target in args.targets() {
        let mux = mux.clone();
        streams.spawn(async move {
            let label = target.clone();
            let failed = target.clone();
            let listener = StreamListener::new(move |message| {
                println!("[{label}] {}", message.data);
            })
            .on_error(move |err| warn!(stream = %failed, error = %err, "stream closed"));

            match mux.open(target.clone(), listener).await {
                Ok(_closer) => {
                    info!(stream = %target, "following");
                    // Aborting the task drops the closer.
                    std::future::pending::<()>().await;
                }
                Err(err) => warn!(stream = %target, error = %err, "could not open stream"),
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    streams.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_cover_list_and_jobs() {
        let job = JobId::new();
        let args = WatchArgs {
            url: "http://localhost:3000/".into(),
            jobs: vec![job],
        };
        assert_eq!(
            args.targets(),
            vec![
                "http://localhost:3000/jobs/events".to_string(),
                format!("http://localhost:3000/jobs/{job}/events"),
            ]
        );
    }
}
