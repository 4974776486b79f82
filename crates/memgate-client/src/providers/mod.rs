pub mod http;

pub use http::HttpMemoryClient;
