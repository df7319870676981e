//! Latest-buffer subscriptions.

mod throttle;

pub use throttle::{Throttle, ThrottleExt};

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::types::{BufferEvent, UpdateRate};

/// Stream of the most recently ingested buffer, at most `rate` times per second.
///
/// Slow consumers skip intermediate buffers rather than queueing them.
pub(crate) fn latest_buffers(
    latest: watch::Receiver<Option<BufferEvent>>,
    rate: UpdateRate,
) -> BoxStream<'static, BufferEvent> {
    let events = WatchStream::new(latest).filter_map(|event| async move { event });
    match rate.throttle_interval() {
        None => events.boxed(),
        Some(interval) => events.throttle(interval).boxed(),
    }
}
