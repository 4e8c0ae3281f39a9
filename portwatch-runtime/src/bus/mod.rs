//! Event bus adapter: publishes `BusMessage`s on the `detections:{stream_id}`
//! channel. Grounded on `ferrex-core`'s `InProcJobEventBus` (broadcast-channel
//! pub/sub) and `RedisCache` (`ConnectionManager`-backed Redis access).

mod adapter;

pub use adapter::{EventBusAdapter, InProcEventBus, RedisEventBus};
