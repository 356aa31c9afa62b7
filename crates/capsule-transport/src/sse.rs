//! Server-Sent-Events run stream (`/api/v1/capsules/run/{run_id}/stream`)
//!
//! SSE has no client-to-server channel, so cancellation always goes over the
//! HTTP side channel.

use crate::cancel::CancelChannel;
use crate::control::{TransportKind, is_subscribed};
use crate::endpoints::Endpoints;
use crate::handler::{Delivery, RunHandler};
use crate::http::{authorized, error_from_response, transport_error};
use crate::manager::{RunConnection, Transport};
use async_trait::async_trait;
use capsule_core::{Result, SseBlock, SseParser};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub struct SseTransport {
    endpoints: Arc<Endpoints>,
    client: reqwest::Client,
    canceller: Arc<dyn CancelChannel>,
}

impl SseTransport {
    pub fn new(
        endpoints: Arc<Endpoints>,
        client: reqwest::Client,
        canceller: Arc<dyn CancelChannel>,
    ) -> Self {
        Self {
            endpoints,
            client,
            canceller,
        }
    }
}

impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn open(&self, run_id: &str, handler: Arc<dyn RunHandler>) -> Box<dyn RunConnection> {
        let delivery = Delivery::new(handler);
        let shutdown = CancellationToken::new();

        let request = authorized(
            self.client
                .get(self.endpoints.sse_url(run_id))
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache"),
            self.endpoints.token(),
        );
        let span = capsule_telemetry::run_span(run_id, TransportKind::Sse.as_str());
        tokio::spawn(run_stream(request, delivery.clone(), shutdown.clone()).instrument(span));

        Box::new(SseConnection {
            run_id: run_id.to_string(),
            canceller: self.canceller.clone(),
            delivery,
            shutdown,
        })
    }
}

pub struct SseConnection {
    run_id: String,
    canceller: Arc<dyn CancelChannel>,
    delivery: Arc<Delivery>,
    shutdown: CancellationToken,
}

#[async_trait]
impl RunConnection for SseConnection {
    fn transport(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn cancel(&self) -> Result<()> {
        self.canceller.cancel_run(&self.run_id).await
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.delivery.close();
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_stream(
    request: reqwest::RequestBuilder,
    delivery: Arc<Delivery>,
    shutdown: CancellationToken,
) {
    let response = tokio::select! {
        _ = shutdown.cancelled() => {
            delivery.close();
            return;
        }
        response = request.send() => response,
    };

    let response = match response {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            delivery.error(error_from_response(resp).await);
            delivery.close();
            return;
        }
        Err(e) => {
            delivery.error(transport_error("SSE request failed", e));
            delivery.close();
            return;
        }
    };

    delivery.open(TransportKind::Sse);

    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => break,
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for block in parser.push(&bytes) {
                    if delivery.is_closed() {
                        break;
                    }
                    deliver_block(&delivery, &block);
                }
            }
            Some(Err(e)) => {
                delivery.error(transport_error("SSE stream error", e));
                break;
            }
            None => {
                tracing::debug!(buffered = parser.buffered(), "SSE stream ended");
                break;
            }
        }
    }

    delivery.close();
}

fn deliver_block(delivery: &Delivery, block: &SseBlock) {
    match block.event.as_deref() {
        Some(name) if is_subscribed(name) => match block.decode() {
            Ok(event) => delivery.event(event),
            Err(e) => delivery.error(e.into()),
        },
        other => {
            tracing::debug!(event = ?other, "Skipping unsubscribed SSE block");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{StreamSignal, signal_channel};
    use capsule_core::RunEventType;

    fn feed(delivery: &Delivery, raw: &str) {
        let mut parser = SseParser::new();
        for block in parser.push(raw.as_bytes()) {
            deliver_block(delivery, &block);
        }
    }

    #[test]
    fn test_only_subscribed_names_are_delivered() {
        let (handler, mut rx) = signal_channel();
        let delivery = Delivery::new(handler);

        feed(
            &delivery,
            concat!(
                "data: {\"type\":\"run.started\",\"run_id\":\"r1\"}\n\n",
                "event: heartbeat\ndata: {}\n\n",
                "event: run.started\ndata: {\"type\":\"run.started\",\"run_id\":\"r1\"}\n\n",
            ),
        );

        match rx.try_recv() {
            Ok(StreamSignal::Event(event)) => assert_eq!(event.event_type, RunEventType::Started),
            other => panic!("unexpected signal: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_malformed_block_reports_and_continues() {
        let (handler, mut rx) = signal_channel();
        let delivery = Delivery::new(handler);

        feed(
            &delivery,
            concat!(
                "event: run.partial\ndata: not-json\n\n",
                "event: run.completed\ndata: {\"type\":\"run.completed\",\"run_id\":\"r1\"}\n\n",
            ),
        );

        assert!(matches!(
            rx.try_recv(),
            Ok(StreamSignal::Error(capsule_core::Error::Decode(_)))
        ));
        assert!(matches!(rx.try_recv(), Ok(StreamSignal::Event(_))));
    }
}
