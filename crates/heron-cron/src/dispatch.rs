//! The dispatcher seam: hand a task to an execution target and wait for
//! its synchronous accept/reject, never for completion.

use std::future::Future;
use std::time::Duration;

use crate::config::{DispatchReply, DispatchRequest};

/// One trait, one operation — implement this to replace the dispatch step
/// in tests.
///
/// A transport failure or timeout is surfaced as `Err`; the coordinator
/// treats both exactly like an explicit rejection (failed execution, no
/// retry within this core).
pub trait Dispatcher: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync;

    fn dispatch(
        &self,
        target: &str,
        request: &DispatchRequest,
        timeout: Duration,
    ) -> impl Future<Output = Result<DispatchReply, Self::Error>> + Send;
}
