//! Handoff seam for terminal game results.
//!
//! The coordinator does not own permanent storage; it hands each
//! [`GameSummary`] to whatever sink the binary wires in. A bounded
//! channel sender is the stock implementation.

use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc::Sender;

use crate::model::GameSummary;

pub trait ResultSink: Clone + Send + Sync + 'static {
    fn record<'a>(
        &'a self,
        summary: GameSummary,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

impl ResultSink for Sender<GameSummary> {
    fn record<'a>(
        &'a self,
        summary: GameSummary,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.send(summary)
                .await
                .map_err(|err| anyhow::anyhow!("failed to hand off game result: {}", err))
        })
    }
}
