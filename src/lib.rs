pub mod capture;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod history;
pub mod protocol;
pub mod session;
pub mod sync;

pub use engine::{Collaborators, MirrorEngine};
pub use error::{EngineError, Result};
