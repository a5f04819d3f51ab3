mod aggregator;
mod bus;
mod types;

pub use aggregator::{AggregatorSettings, EventAggregator};
pub use bus::{EventBus, EventReceiver, EventSink};
pub use types::{DetectionEvent, EventKind};
