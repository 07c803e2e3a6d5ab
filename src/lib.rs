pub mod config;
pub mod event;
pub mod ingestor;
pub mod messaging;
pub mod notifier;
pub mod observability;
pub mod shutdown;
pub mod storage;
