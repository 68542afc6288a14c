pub mod events;
pub mod outcome;
pub mod prompt;
pub mod request;
pub mod transcript;
