pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{RedraftError, Result};
pub use event::EventBus;
pub use state::{ResearchState, RunInput, StateField, StateUpdate};
pub use traits::{GenerationService, SearchService};
pub use types::*;
