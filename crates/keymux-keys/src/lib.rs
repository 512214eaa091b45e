//! Credential pooling for keymux.
//!
//! This crate owns every piece of key state: per-provider records, the pure
//! selection order, background health checking, and the service-agnostic
//! pool router. It deliberately performs no HTTP itself; probe transports
//! are injected.

pub mod checker;
pub mod events;
pub mod family;
pub mod key;
pub mod pool;
pub mod prioritizer;
pub mod provider;
pub mod providers;
pub mod ring;

pub use checker::{
    CheckerConfig, KeyProbe, ProbeAuth, ProbeClient, ProbeOutcome, ProbeRequest, ProbeResponse,
};
pub use events::{Event, EventHub, EventSink, LogEventSink};
pub use family::{ModelFamily, Service, family_of, service_of};
pub use key::{AnthropicTier, AwsLoggingStatus, Key, KeyDetail, KeyPatch, key_hash, now_ms};
pub use pool::KeyPool;
pub use prioritizer::prioritize;
pub use provider::KeyProvider;
pub use ring::{KeyPoolError, KeyRing};
