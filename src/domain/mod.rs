//! Usage: Chat domain logic (message tag format, markup, requests/records, conversations, resume).

pub mod content;
pub mod conversations;
pub mod generation;
pub mod markup;
pub mod resume;
