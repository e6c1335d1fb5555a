//! Request and response snapshots, and the network boundary.

mod fetcher;
mod request;
mod response;

#[cfg(test)]
pub mod testing;

pub use fetcher::{FetchError, Fetcher, HttpFetcher};
pub use request::{Destination, Request, RequestMode};
pub use response::Response;
