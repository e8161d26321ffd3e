//! Rate limiting logic and state management.

mod backend;
mod distributed;
mod key;
mod policy;
mod resolver;
mod store;
mod window;

pub use backend::AdmissionAlgorithm;
pub use distributed::DistributedLimiter;
pub use key::PartitionKey;
pub use policy::{PolicyHint, PolicyType, RequestContext};
pub use resolver::{EffectiveLimit, PolicyResolver};
pub use store::{AtomicStore, InMemoryStore, RedisStore, CONSUME_SCRIPT};
pub use window::{LocalWindowLimiter, WindowState};
