//! Outbound HTTP host function.
//!
//! Enable with the `http` feature flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method};
use serde::Serialize;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::config::HttpConfig;
use crate::error::{MatchError, Result};

const USER_AGENT: &str = concat!("kaos-match/", env!("CARGO_PKG_VERSION"));

/// A request issued by a handler.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    /// Overrides the client default for this call only.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            ..Default::default()
        }
    }
}

/// `{code, headers, body}` as handed back to the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpResponse {
    pub code: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: String,
}

/// Blocking HTTP client shared by every handler on the node.
pub struct HttpClient {
    client: Client,
    runtime: Arc<Runtime>,
    default_timeout: Duration,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| MatchError::Http(format!("failed to create HTTP client: {}", e)))?;
        let runtime = Runtime::new()?;

        Ok(Self {
            client,
            runtime: Arc::new(runtime),
            default_timeout: Duration::from_millis(config.default_timeout_ms),
        })
    }

    pub fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        if request.url.is_empty() {
            return Err(MatchError::protocol("URL string cannot be empty."));
        }
        let method = parse_method(&request.method)?;
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let mut builder = self.client.request(method, &request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body.filter(|b| !b.is_empty()) {
            builder = builder.body(body);
        }

        debug!(url = %request.url, ?timeout, "http request");
        self.runtime.block_on(async move {
            let response = builder
                .send()
                .await
                .map_err(|e| MatchError::Http(format!("HTTP request error: {}", e)))?;

            let code = response.status().as_u16();
            let mut headers: HashMap<String, Vec<String>> = HashMap::new();
            for (name, value) in response.headers() {
                headers
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
            }
            let body = response
                .text()
                .await
                .map_err(|e| MatchError::Http(format!("HTTP response body error: {}", e)))?;

            Ok::<_, MatchError>(HttpResponse { code, headers, body })
        })
    }
}

/// Case-insensitive; only GET, POST, PUT and PATCH are allowed.
pub fn parse_method(method: &str) -> Result<Method> {
    match method.to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        _ => Err(MatchError::protocol(
            "Invalid method must be one of: 'get', 'post', 'put', 'patch'.",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(response: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !String::from_utf8_lossy(&received).contains("\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });
        (url, handle)
    }

    #[test]
    fn test_method_whitelist() {
        assert_eq!(parse_method("get").unwrap(), Method::GET);
        assert_eq!(parse_method("Patch").unwrap(), Method::PATCH);
        let err = parse_method("DELETE").unwrap_err();
        assert!(err.to_string().contains("Invalid method must be one of"));
    }

    #[test]
    fn test_empty_url_rejected() {
        let client = HttpClient::new(&HttpConfig::default()).unwrap();
        let err = client.request(HttpRequest::new("GET", "")).unwrap_err();
        assert!(err.to_string().contains("URL string cannot be empty."));
    }

    #[test]
    fn test_response_shape() {
        let (url, server) = serve_once(
            "HTTP/1.1 201 Created\r\nContent-Length: 5\r\nX-Match: a\r\nConnection: close\r\n\r\nhello",
        );
        let client = HttpClient::new(&HttpConfig::default()).unwrap();

        let mut request = HttpRequest::new("get", url);
        request.headers.insert("X-Token".to_string(), "t1".to_string());
        let response = client.request(request).unwrap();

        assert_eq!(response.code, 201);
        assert_eq!(response.body, "hello");
        assert_eq!(response.headers.get("x-match"), Some(&vec!["a".to_string()]));

        let raw = server.join().unwrap().to_lowercase();
        assert!(raw.starts_with("get /hook"));
        assert!(raw.contains("x-token: t1"));
    }

    #[test]
    fn test_per_call_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let client = HttpClient::new(&HttpConfig::default()).unwrap();
        let mut request = HttpRequest::new("GET", url);
        request.timeout = Some(Duration::from_millis(50));
        assert!(matches!(client.request(request), Err(MatchError::Http(_))));
        server.join().unwrap();
    }
}
