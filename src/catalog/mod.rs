//! Remote catalog access: page fetching, pagination and record
//! normalization.

pub mod cursor;
pub mod danbooru;
pub mod error;
pub mod item;

pub use cursor::{Cursor, PageRequest, Pagination};
pub use danbooru::DanbooruClient;
pub use error::CatalogError;
pub use item::{Item, MalformedRecord};

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Identity sent with every request. Some CDNs answer 403 to clients that
/// do not present a browser-like or tool-specific user agent.
pub const USER_AGENT: &str = concat!("boorudl-rs/", env!("CARGO_PKG_VERSION"));

/// Account credentials, sent as `login` / `api_key` query parameters.
#[derive(Clone)]
pub struct Credentials {
    pub login: String,
    pub api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Attach the credentials to a request.
    pub fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.query(&[("login", &self.login), ("api_key", &self.api_key)])
    }
}

/// Source of raw catalog pages.
///
/// Records are returned in catalog order; an empty page means the end of
/// the catalog has been reached.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Value>, CatalogError>;
}

/// Build the shared HTTP client used for both catalog pages and content.
pub fn http_client(user_agent: &str) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(600))
        .build()
}
