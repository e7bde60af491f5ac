use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{StreamConnector, StreamMessage, StreamTransport, TransportError, TransportSink};

/// Server-sent-events transport over `reqwest`.
#[derive(Debug, Clone)]
pub struct EventSourceConnector {
    client: reqwest::Client,
    runtime: Handle,
}

impl EventSourceConnector {
    /// Uses the current tokio runtime. Panics outside a runtime.
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_runtime(client, Handle::current())
    }

    pub fn with_runtime(client: reqwest::Client, runtime: Handle) -> Self {
        Self { client, runtime }
    }
}

impl StreamConnector for EventSourceConnector {
    fn connect(
        &self,
        target: &str,
        sink: TransportSink,
    ) -> Result<Box<dyn StreamTransport>, TransportError> {
        let mut source = EventSource::new(self.client.get(target))
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let task = self.runtime.spawn(async move {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => trace!(stream = %sink.target(), "event source open"),
                    Ok(Event::Message(message)) => sink.message(StreamMessage {
                        event: Some(message.event).filter(|name| !name.is_empty()),
                        data: message.data,
                        id: Some(message.id).filter(|id| !id.is_empty()),
                    }),
                    Err(err) => {
                        debug!(stream = %sink.target(), error = %err, "event source failed");
                        source.close();
                        sink.error(TransportError::Stream(err.to_string()));
                        return;
                    }
                }
            }
            sink.error(TransportError::Stream("stream ended".into()));
        });

        Ok(Box::new(EventSourceTransport { task }))
    }
}

struct EventSourceTransport {
    task: JoinHandle<()>,
}

impl StreamTransport for EventSourceTransport {
    fn close(&mut self) {
        self.task.abort();
    }
}

impl Drop for EventSourceTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}
