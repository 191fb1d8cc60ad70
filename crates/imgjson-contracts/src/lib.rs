//! Pure building blocks for imgjson: the model-output JSON extractor, the
//! description fallbacks and prompts, credentials, chat intents and the
//! session/event records written for every run.

pub mod chat;
pub mod credentials;
pub mod description;
pub mod events;
pub mod extract;
pub mod image_data;
pub mod models;
pub mod prompts;
pub mod providers;
pub mod session;

pub use extract::{
    extract_description, extract_with_strategy, Description, ExtractStrategy, Extraction,
};
