pub mod connectivity;
pub mod http_api;

pub use connectivity::{ConnectivityProbe, ConnectivityState};
pub use http_api::{run_http_api, ApiContext};
