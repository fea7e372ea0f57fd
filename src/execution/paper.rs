//! Paper venue for dry runs: acknowledges everything, optionally fills in full.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::{Error, ExecutionClient, ExecutionEvent, Fill, OrderId, OrderRequest, Result};

pub struct PaperExecutionClient {
    events: flume::Sender<ExecutionEvent>,
    resting: Mutex<HashMap<OrderId, OrderRequest>>,
    fill_on_ack: bool,
}

impl PaperExecutionClient {
    pub fn new(events: flume::Sender<ExecutionEvent>, fill_on_ack: bool) -> Self {
        Self {
            events,
            resting: Mutex::new(HashMap::new()),
            fill_on_ack,
        }
    }

    async fn emit(&self, event: ExecutionEvent) -> Result<()> {
        self.events.send_async(event).await.map_err(|_| Error::ExecutionClosed)
    }

    pub fn resting_orders(&self) -> usize {
        self.resting.lock().len()
    }
}

#[async_trait]
impl ExecutionClient for PaperExecutionClient {
    async fn submit(&self, request: &OrderRequest) -> Result<()> {
        tracing::info!(
            order_id = %request.order_id,
            side = %request.side,
            instrument = %request.instrument,
            price = %request.price,
            size = %request.size,
            "[PAPER] order accepted"
        );
        if !self.fill_on_ack {
            self.resting.lock().insert(request.order_id, request.clone());
        }
        self.emit(ExecutionEvent::Ack { order_id: request.order_id }).await?;

        if self.fill_on_ack {
            self.emit(ExecutionEvent::Fill(Fill {
                order_id: request.order_id,
                fill_id: Uuid::new_v4().to_string(),
                price: request.price,
                size: request.size,
                timestamp: Utc::now(),
            }))
            .await?;
        }
        Ok(())
    }

    async fn cancel(&self, order_id: OrderId) -> Result<()> {
        let removed = self.resting.lock().remove(&order_id);
        let event = match removed {
            Some(_) => ExecutionEvent::CancelAck { order_id },
            None => ExecutionEvent::CancelRejected {
                order_id,
                reason: "order not resting".to_string(),
            },
        };
        self.emit(event).await
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Instrument, Side};
    use rust_decimal_macros::dec;

    fn request(id: u64) -> OrderRequest {
        OrderRequest {
            order_id: OrderId(id),
            instrument: Instrument::from("tok"),
            side: Side::Buy,
            price: dec!(0.45),
            size: dec!(10),
        }
    }

    #[tokio::test]
    async fn test_ack_then_cancel() {
        let (tx, rx) = flume::unbounded();
        let client = PaperExecutionClient::new(tx, false);
        client.submit(&request(1)).await.unwrap();
        assert_eq!(rx.recv_async().await.unwrap(), ExecutionEvent::Ack { order_id: OrderId(1) });
        assert_eq!(client.resting_orders(), 1);

        client.cancel(OrderId(1)).await.unwrap();
        assert_eq!(
            rx.recv_async().await.unwrap(),
            ExecutionEvent::CancelAck {
                order_id: OrderId(1)
            }
        );

        client.cancel(OrderId(1)).await.unwrap();
        assert!(matches!(rx.recv_async().await.unwrap(), ExecutionEvent::CancelRejected { .. }));
    }

    #[tokio::test]
    async fn test_fill_on_ack() {
        let (tx, rx) = flume::unbounded();
        let client = PaperExecutionClient::new(tx, true);
        client.submit(&request(7)).await.unwrap();
        assert!(matches!(rx.recv_async().await.unwrap(), ExecutionEvent::Ack { .. }));
        match rx.recv_async().await.unwrap() {
            ExecutionEvent::Fill(fill) => {
                assert_eq!(fill.order_id, OrderId(7));
                assert_eq!(fill.size, dec!(10));
                assert_eq!(fill.price, dec!(0.45));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.resting_orders(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_is_error() {
        let (tx, rx) = flume::unbounded();
        drop(rx);
        let client = PaperExecutionClient::new(tx, false);
        assert!(matches!(client.submit(&request(1)).await, Err(Error::ExecutionClosed)));
    }
}
