pub mod email;
pub mod http;

pub use email::EmailSendHandler;
pub use http::HttpRequestHandler;
