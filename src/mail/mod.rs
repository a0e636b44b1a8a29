pub mod cache;
pub mod matcher;

pub use matcher::ReplyMatcher;
