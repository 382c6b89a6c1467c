//! The provider surface: how application data sources plug into the
//! server.
//!
//! A [`Provider`] resolves channel names to [`ChannelRecord`] handles.
//! Records expose synchronous read/write (cheap, in-memory state) and
//! asynchronous process/RPC (application work of unknown cost), plus a
//! subscription hook through which the record pushes updates into every
//! open monitor.

use std::sync::Arc;

use async_trait::async_trait;
use pva_proto::{BitSet, PvStructure, Status, StructDesc};

/// Sink a record pushes updates into: `(value, changed, overrun)` in the
/// record's own offset space.
pub type MonitorSink = Arc<dyn Fn(&PvStructure, &BitSet, &BitSet) + Send + Sync>;

/// One hosted channel.
#[async_trait]
pub trait ChannelRecord: Send + Sync {
    /// The record's full structure descriptor.
    fn descriptor(&self) -> Arc<StructDesc>;

    /// Snapshot the current value; the mask marks valid offsets
    /// (normally all of them).
    fn read(&self) -> (PvStructure, BitSet);

    /// Apply a write of the masked fields.
    fn write(&self, value: &PvStructure, changed: &BitSet) -> Status;

    /// Process the record (whatever that means for the application).
    async fn process(&self) -> Status;

    /// Handle a remote procedure call.
    async fn rpc(&self, args: PvStructure) -> Result<PvStructure, Status> {
        let _ = args;
        Err(Status::error("rpc not supported by this channel"))
    }

    /// Register a monitor sink under `id`; the record calls it for every
    /// update until [`ChannelRecord::unsubscribe`].
    fn subscribe(&self, id: u64, sink: MonitorSink);

    /// Remove a sink.
    fn unsubscribe(&self, id: u64);
}

/// A named source of channels.
pub trait Provider: Send + Sync {
    /// Provider name used by configuration ordering.
    fn provider_name(&self) -> &str;

    /// Resolve a channel name.
    fn lookup(&self, channel: &str) -> Option<Arc<dyn ChannelRecord>>;
}

/// Name → provider map with a configured lookup order.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Build a registry. `order` (the `provider_names` configuration)
    /// promotes matching providers to the front, keeping registration
    /// order otherwise.
    pub fn new(mut providers: Vec<Arc<dyn Provider>>, order: &[String]) -> Self {
        if !order.is_empty() {
            providers.sort_by_key(|p| {
                order
                    .iter()
                    .position(|name| name == p.provider_name())
                    .unwrap_or(usize::MAX)
            });
        }
        Self { providers }
    }

    /// Resolve a channel across providers in priority order.
    pub fn lookup(&self, channel: &str) -> Option<Arc<dyn ChannelRecord>> {
        self.providers.iter().find_map(|p| p.lookup(channel))
    }

    /// Whether any provider hosts the channel.
    pub fn hosts(&self, channel: &str) -> bool {
        self.lookup(channel).is_some()
    }

    /// Registered provider names, in lookup order.
    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.provider_name().to_owned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProvider(&'static str);

    impl Provider for NullProvider {
        fn provider_name(&self) -> &str {
            self.0
        }

        fn lookup(&self, _channel: &str) -> Option<Arc<dyn ChannelRecord>> {
            None
        }
    }

    #[test]
    fn configured_order_wins() {
        let registry = ProviderRegistry::new(
            vec![Arc::new(NullProvider("a")), Arc::new(NullProvider("b"))],
            &["b".to_owned(), "a".to_owned()],
        );
        assert_eq!(registry.names(), vec!["b", "a"]);
    }

    #[test]
    fn unlisted_providers_keep_registration_order() {
        let registry = ProviderRegistry::new(
            vec![
                Arc::new(NullProvider("x")),
                Arc::new(NullProvider("y")),
                Arc::new(NullProvider("z")),
            ],
            &["z".to_owned()],
        );
        assert_eq!(registry.names(), vec!["z", "x", "y"]);
    }
}
