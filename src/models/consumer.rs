//! Consumer and lifecycle-hook contracts

use crate::models::event::ListenerContext;
use crate::models::offset::Offset;
use async_trait::async_trait;

/// Downstream consumer of the multiplexed event stream.
///
/// `consume_event` is invoked inline on the delivery path; a slow consumer
/// slows the transport, which is the intended backpressure mechanism. The
/// consumer acknowledges each event it wants checkpointed via
/// [`ListenerContext::ack`].
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Handle one delivered event.
    async fn consume_event(&self, ctx: ListenerContext);

    /// Observe every successful offset store, acked or not.
    ///
    /// Called synchronously from the dispatch path; keep it cheap.
    fn track_offset(&self, _vb_id: u16, _offset: &Offset) {}
}

/// Hooks invoked at labeled lifecycle points, all awaited inline.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn before_stream_start(&self) {}
    async fn after_stream_start(&self) {}
    async fn before_stream_stop(&self) {}
    async fn after_stream_stop(&self) {}
    async fn before_rebalance_start(&self) {}
    async fn after_rebalance_start(&self) {}
    async fn before_rebalance_end(&self) {}
    async fn after_rebalance_end(&self) {}
}

/// Event handler that does nothing at every hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventHandler;

#[async_trait]
impl EventHandler for NoopEventHandler {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConsumer {
        consumed: AtomicUsize,
        tracked: AtomicUsize,
    }

    #[async_trait]
    impl Consumer for CountingConsumer {
        async fn consume_event(&self, ctx: ListenerContext) {
            self.consumed.fetch_add(1, Ordering::SeqCst);
            ctx.ack();
        }

        fn track_offset(&self, _vb_id: u16, _offset: &Offset) {
            self.tracked.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_noop_handler() {
        let handler = NoopEventHandler;
        handler.before_stream_start().await;
        handler.after_stream_stop().await;
    }

    #[test]
    fn test_consumer_object_safety() {
        fn assert_consumer(_: &dyn Consumer) {}
        let consumer = CountingConsumer {
            consumed: AtomicUsize::new(0),
            tracked: AtomicUsize::new(0),
        };
        assert_consumer(&consumer);
    }
}
