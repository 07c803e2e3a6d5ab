//! HTTP side: turns storage "object finalized" events into broker messages

mod error;
pub mod message;
mod server;
pub mod services;
pub mod state;
pub(crate) mod utils;

pub use error::NotifyError;
pub use message::build_message;
pub use server::{router, run};
pub use state::NotifierState;
