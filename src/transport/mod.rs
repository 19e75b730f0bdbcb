mod http;

pub use http::HttpChunkTransport;
