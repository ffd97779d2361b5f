use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{CatalogClient, CatalogError, Credentials, PageRequest};

/// Body Danbooru sends alongside most non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// The Danbooru `posts.json` listing endpoint.
pub struct DanbooruClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl std::fmt::Debug for DanbooruClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DanbooruClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl DanbooruClient {
    pub fn new(http: Client, base_url: &str, credentials: Option<Credentials>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn posts_url(&self) -> String {
        format!("{}/posts.json", self.base_url)
    }
}

#[async_trait]
impl CatalogClient for DanbooruClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Value>, CatalogError> {
        let url = self.posts_url();
        debug!(
            tags = %request.tags,
            page = request.page,
            limit = request.limit,
            "Requesting catalog page"
        );

        let page = request.page.to_string();
        let limit = request.limit.to_string();
        let mut builder = self.http.get(&url).query(&[
            ("tags", request.tags.as_str()),
            ("page", page.as_str()),
            ("limit", limit.as_str()),
        ]);
        if let Some(credentials) = &self.credentials {
            builder = credentials.apply(builder);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            if let Ok(body) = response.json::<ErrorBody>().await {
                if let Some(message) = body.message.filter(|m| !m.is_empty()) {
                    warn!(status = status.as_u16(), "Catalog rejected request: {}", message);
                }
            }
            return Err(CatalogError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.bytes().await?;
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Array(records)) => Ok(records),
            Ok(other) => Err(CatalogError::Decode(format!(
                "expected array, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(CatalogError::Decode(e.to_string())),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> PageRequest {
        PageRequest {
            tags: "id:>=1 order:id_asc".into(),
            page: 1,
            limit: 100,
        }
    }

    #[tokio::test]
    async fn test_fetch_page_sends_query_and_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .and(query_param("tags", "id:>=1 order:id_asc"))
            .and(query_param("page", "1"))
            .and(query_param("limit", "100"))
            .and(query_param("login", "alice"))
            .and(query_param("api_key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1}, {"id": 2}
            ])))
            .mount(&server)
            .await;

        let client = DanbooruClient::new(
            Client::new(),
            &format!("{}/", server.uri()),
            Some(Credentials {
                login: "alice".into(),
                api_key: "secret".into(),
            }),
        );
        let records = client.fetch_page(&request()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["id"], 2);
    }

    #[tokio::test]
    async fn test_forbidden_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = DanbooruClient::new(Client::new(), &server.uri(), None);
        let err = client.fetch_page(&request()).await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_rejection_with_message_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
                "success": false,
                "message": "You cannot search for more than 2 tags at a time",
            })))
            .mount(&server)
            .await;

        let client = DanbooruClient::new(Client::new(), &server.uri(), None);
        let err = client.fetch_page(&request()).await.unwrap_err();
        assert!(matches!(err, CatalogError::HttpStatus { status: 422, .. }));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = DanbooruClient::new(Client::new(), &server.uri(), None);
        let err = client.fetch_page(&request()).await.unwrap_err();
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn test_non_array_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": false})))
            .mount(&server)
            .await;

        let client = DanbooruClient::new(Client::new(), &server.uri(), None);
        let err = client.fetch_page(&request()).await.unwrap_err();
        assert!(matches!(err, CatalogError::Decode(_)));
    }
}
