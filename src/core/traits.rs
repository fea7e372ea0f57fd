//! Core traits - Seams to external collaborators

use async_trait::async_trait;
use crate::core::{OrderId, OrderRequest, Result};

/// Signing and submission capability for one venue.
///
/// Both calls are fire-and-forget: an `Ok` only means the request left the
/// process. Acks, fills, rejections and cancel confirmations arrive later as
/// [`ExecutionEvent`](crate::core::ExecutionEvent)s, possibly duplicated or
/// out of order. An `Err` from `submit` means the venue never saw the order.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Submit an order
    async fn submit(&self, request: &OrderRequest) -> Result<()>;

    /// Request cancellation of an order
    async fn cancel(&self, order_id: OrderId) -> Result<()>;

    /// Venue name
    fn name(&self) -> &str;
}
