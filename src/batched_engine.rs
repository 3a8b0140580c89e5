use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::{Instant, interval};

use crate::config::BatchConfig;
use crate::engine::{BatchedEngine, Engine};
use crate::types::{ClassificationRequest, ClassificationResponse};

type ResponseSender = oneshot::Sender<Result<ClassificationResponse>>;

#[derive(Debug)]
struct QueuedRequest {
    request: ClassificationRequest,
    response_tx: ResponseSender,
}

/// Handler-facing handle that funnels every request through the single
/// background [`BatchProcessor`]. This serializes forward passes: the model
/// only ever runs inside the processor task, so per-request state never
/// crosses between concurrent callers.
pub struct BatchedEngineWrapper {
    request_tx: flume::Sender<QueuedRequest>,
}

impl BatchedEngineWrapper {
    pub fn new<T: BatchedEngine + 'static>(
        config: BatchConfig,
        batched_engine: T,
    ) -> (Self, BatchProcessor<T>) {
        let (request_tx, request_rx) = flume::bounded(0); // Rendezvous channel

        let processor = BatchProcessor {
            request_rx,
            config,
            request_queue: VecDeque::new(),
            batched_engine,
        };

        let engine = Self { request_tx };

        (engine, processor)
    }
}

#[async_trait]
impl Engine for BatchedEngineWrapper {
    #[tracing::instrument(skip(self, request), fields(text_len = request.text.len()))]
    async fn classify(&self, request: ClassificationRequest) -> Result<ClassificationResponse> {
        let (response_tx, response_rx) = oneshot::channel();

        let queued_request = QueuedRequest {
            request,
            response_tx,
        };

        self.request_tx
            .send_async(queued_request)
            .await
            .map_err(|_| anyhow::anyhow!("Engine queue is closed"))?;

        response_rx
            .await
            .map_err(|_| anyhow::anyhow!("Response channel closed"))?
    }
}

pub struct BatchProcessor<T: BatchedEngine> {
    request_rx: flume::Receiver<QueuedRequest>,
    config: BatchConfig,
    request_queue: VecDeque<QueuedRequest>,
    batched_engine: T,
}

impl<T: BatchedEngine> BatchProcessor<T> {
    #[tracing::instrument(skip(self))]
    pub async fn run_forever(mut self) -> Result<()> {
        let mut tick_timer = interval(self.config.tick_duration);

        loop {
            tokio::select! {
                request = self.request_rx.recv_async() => {
                    match request {
                        Ok(req) => {
                            self.request_queue.push_back(req);
                            tracing::debug!(queue_size = self.request_queue.len(), "Request received and queued");

                            if self.request_queue.len() >= self.config.batch_size {
                                tracing::debug!(batch_size = self.config.batch_size, "Batch size reached, processing immediately");
                                self.process_batch().await;
                            }
                        }
                        Err(_) => {
                            tracing::info!("Channel closed, processing remaining requests and exiting");
                            if !self.request_queue.is_empty() {
                                self.process_batch().await;
                            }
                            break Ok(());
                        }
                    }
                }

                // Flush pending requests even if the batch isn't full
                _ = tick_timer.tick() => {
                    if !self.request_queue.is_empty() {
                        tracing::debug!(pending_requests = self.request_queue.len(), "Tick timer fired, processing pending requests");
                        self.process_batch().await;
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn process_batch(&mut self) {
        let batch_start = Instant::now();

        // Up to batch_size requests in FIFO order
        let batch: Vec<_> = self
            .request_queue
            .drain(..self.config.batch_size.min(self.request_queue.len()))
            .collect();

        if batch.is_empty() {
            return;
        }

        tracing::debug!(batch_size = batch.len(), "Processing batch");

        let requests: Vec<_> = batch.iter().map(|req| req.request.clone()).collect();
        let response_channels: Vec<_> = batch.into_iter().map(|req| req.response_tx).collect();

        let responses = self.batched_engine.classify_batch(requests).await;

        // Responses come back in submission order, one per request
        match responses {
            Ok(response_vec) => {
                for (response_tx, response_result) in
                    response_channels.into_iter().zip(response_vec.into_iter())
                {
                    let _ = response_tx.send(response_result);
                }
            }
            Err(err) => {
                tracing::error!("Batch processing failed: {}", err);
                for response_tx in response_channels {
                    let _ =
                        response_tx.send(Err(anyhow::anyhow!("Batch processing failed: {}", err)));
                }
            }
        }

        tracing::debug!(
            processing_time_ms = batch_start.elapsed().as_millis(),
            "Batch processed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bert_engine::argmax;
    use crate::types::EmotionLabel;
    use std::sync::Arc;

    /// Test double that derives logits from the request text: a text of
    /// `"i"` produces a one-hot logit row for index `i`, and anything else
    /// produces all-zero (fully tied) logits.
    struct CannedLogitsEngine;

    fn logits_for(text: &str) -> [f32; EmotionLabel::COUNT] {
        let mut row = [0.0; EmotionLabel::COUNT];
        if let Ok(index) = text.parse::<usize>() {
            if index < EmotionLabel::COUNT {
                row[index] = 1.0;
            }
        }
        row
    }

    #[async_trait]
    impl BatchedEngine for CannedLogitsEngine {
        async fn classify_batch(
            &self,
            requests: Vec<ClassificationRequest>,
        ) -> Result<Vec<Result<ClassificationResponse>>> {
            let responses = requests
                .iter()
                .map(|request| {
                    let row = logits_for(&request.text);
                    let index = argmax(&row);
                    let label = EmotionLabel::from_index(index)
                        .ok_or_else(|| anyhow::anyhow!("bad index"))?;
                    Ok(ClassificationResponse {
                        id: request.text.clone(),
                        created: 0,
                        label,
                        index,
                        probs: row.iter().map(|&x| x as f64).collect(),
                    })
                })
                .collect();
            Ok(responses)
        }
    }

    fn spawn_engine(batch_size: usize) -> Arc<BatchedEngineWrapper> {
        let config = BatchConfig {
            batch_size,
            tick_duration: std::time::Duration::from_millis(10),
        };
        let (engine, processor) = BatchedEngineWrapper::new(config, CannedLogitsEngine);
        tokio::spawn(processor.run_forever());
        Arc::new(engine)
    }

    #[tokio::test]
    async fn classifies_through_the_queue() {
        let engine = spawn_engine(4);
        let response = engine
            .classify(ClassificationRequest {
                text: "2".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.label, EmotionLabel::Anger);
        assert_eq!(response.index, 2);
    }

    #[tokio::test]
    async fn tied_logits_resolve_to_joy() {
        let engine = spawn_engine(4);
        let response = engine
            .classify(ClassificationRequest {
                text: "all tied".to_string(),
            })
            .await
            .unwrap();
        // All-zero logits tie across every index; the lowest index wins.
        assert_eq!(response.index, 0);
        assert_eq!(response.label, EmotionLabel::Joy);
    }

    #[tokio::test]
    async fn concurrent_requests_do_not_cross_contaminate() {
        let engine = spawn_engine(3);

        let handles: Vec<_> = (0..EmotionLabel::COUNT)
            .cycle()
            .take(24)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let response = engine
                        .classify(ClassificationRequest {
                            text: i.to_string(),
                        })
                        .await
                        .unwrap();
                    (i, response)
                })
            })
            .collect();

        for handle in handles {
            let (i, response) = handle.await.unwrap();
            assert_eq!(response.index, i);
            assert_eq!(response.id, i.to_string());
        }
    }

    #[tokio::test]
    async fn every_prediction_is_one_of_the_six_labels() {
        let engine = spawn_engine(2);
        for text in ["", "0", "5", "happy day", "행복한 하루였다"] {
            let response = engine
                .classify(ClassificationRequest {
                    text: text.to_string(),
                })
                .await
                .unwrap();
            assert!(EmotionLabel::from_index(response.index).is_some());
        }
    }
}
