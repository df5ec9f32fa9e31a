use futures::stream::{self, StreamExt};
use tracing::debug;

use super::Manager;
use crate::error::ManagerError;
use crate::upstream::Upstream;

impl<U: Upstream> Manager<U> {
    /// Submit many independent requests, returning one result per payload in input order.
    ///
    /// Each item goes through normal admission; a failed item does not stop
    /// the rest. At most `max_connections` items of the batch are in
    /// submission at once, so a large batch paces itself instead of flooding
    /// the wait queue.
    pub async fn submit_batch<I>(&self, payloads: I) -> Vec<Result<U::Output, ManagerError>>
    where
        I: IntoIterator<Item = U::Payload>,
    {
        let width = self.admission.max_concurrent().max(1);

        let results: Vec<Result<U::Output, ManagerError>> = stream::iter(payloads)
            .map(|payload| self.submit(payload))
            .buffered(width)
            .collect()
            .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        debug!(total = results.len(), failed, "Batch completed");

        results
    }
}
