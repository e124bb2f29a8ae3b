//! Engine services and external integrations

pub mod bounded_buffer;
pub mod escalation;
pub mod health;
pub mod item_locks;
pub mod logging;
pub mod metrics;
pub mod notifications;
pub mod provider;
pub mod rate_limiter;
pub mod reconciler;
pub mod resolver;
pub mod scanner;
pub mod text_utils;
pub mod tmdb;

pub use bounded_buffer::BoundedBuffer;
pub use escalation::{EscalationPolicy, ItemState, ItemStatus};
pub use item_locks::ItemLocks;
pub use logging::{FileSinkWriter, LogSinks, Sink, init_tracing};
pub use metrics::ResourceSampler;
pub use notifications::{DiscordWebhook, NotificationService, Notifier, TelegramBot};
pub use provider::{MetadataProvider, ProviderError, ResolutionCandidate};
pub use reconciler::{ItemOutcome, Reconciler};
pub use resolver::Resolver;
pub use scanner::{ChunkedScanner, ItemQuota};
pub use tmdb::TmdbClient;
