pub mod backoff;
pub mod config;
pub mod config_validator;
pub mod counter;
pub mod error;
pub mod handlers;
pub mod hashtag;
pub mod health;
pub mod ingester;
pub mod lock;
pub mod memory;
pub mod middleware;
pub mod redis;
pub mod response;
pub mod server;
pub mod source;
pub mod store;
pub mod validation;

pub use config::{ApiConfig, Cli, Command, StreamConfig};
pub use counter::{HashtagCounter, RankEntry};
pub use error::{ApiError, CounterError, Result};
pub use hashtag::extract_hashtags;
pub use ingester::{launch, IngestError, IngestSettings, IngestSummary, Ingester};
pub use server::create_app;
pub use store::CounterStore;
