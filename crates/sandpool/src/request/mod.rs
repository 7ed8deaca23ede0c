//! Outbound HTTP on behalf of scripts.

mod error;
mod options;

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http::header::HOST;
use serde_json::{Map, Value, json};

pub use error::Error;
pub use options::HttpOptions;

use crate::value::Resolution;

const USER_AGENT: &str = "sandpool/0.1";

/// Client settings shared by every request a pool makes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct HttpConfig {
    pub timeout: Option<Duration>,
    pub proxy: Option<String>,
}

impl HttpConfig {
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// # Errors
    /// Returns an error if the proxy URL is invalid or the client cannot be
    /// built.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(builder.build()?)
    }
}

/// Performs `httpRequest` capability calls.
#[derive(Debug, Clone, Default)]
pub struct HttpProxy {
    client: reqwest::Client,
}

impl HttpProxy {
    /// # Errors
    /// See [`HttpConfig::build_client`].
    pub fn new(config: &HttpConfig) -> Result<Self, Error> {
        Ok(Self {
            client: config.build_client()?,
        })
    }

    /// Run the request described by `options`. Resolves with the response
    /// object and the body, or with the failure in the error slot.
    pub async fn send(&self, options: Value) -> Resolution {
        match self.try_send(options).await {
            Ok((response, body)) => Resolution::values(vec![response, body]),
            Err(err) => {
                tracing::debug!(?err, "outbound request failed");
                Resolution::error(&crate::Error::HostFunction(err.to_string()))
            }
        }
    }

    async fn try_send(&self, options: Value) -> Result<(Value, Value), Error> {
        let HttpOptions {
            url,
            method,
            mut headers,
            body,
            json,
            binary,
            timeout,
        } = HttpOptions::from_value(options)?;

        // Let the client derive `Host` from the URL.
        headers.remove(HOST);
        let mut request = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                let value = value.to_str().map_or_else(
                    |_| Value::String(STANDARD.encode(value.as_bytes())),
                    |s| Value::String(s.to_string()),
                );
                (name.as_str().to_string(), value)
            })
            .collect();
        let bytes = response.bytes().await?;
        let body = decode_body(bytes, json, binary);

        Ok((
            json!({
                "statusCode": status,
                "headers": headers,
                "body": body,
            }),
            body,
        ))
    }
}

fn decode_body(bytes: Bytes, json: bool, binary: bool) -> Value {
    if binary {
        return Value::String(STANDARD.encode(&bytes));
    }
    match String::from_utf8(bytes.to_vec()) {
        Ok(text) if json => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        Ok(text) => Value::String(text),
        Err(_) => Value::String(STANDARD.encode(&bytes)),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context as _;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_string, header, method, path},
    };

    use super::HttpProxy;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn text_and_json_bodies() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .and(header("content-type", "application/json"))
            .and(body_string(r#"{"hello":"world"}"#))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("content-type", "application/json")
                    .set_body_string(r#"{"ok":true}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let proxy = HttpProxy::default();
        let results = proxy
            .send(json!({
                "url": format!("{}/echo", server.uri()),
                "method": "POST",
                "body": {"hello": "world"},
                "json": true,
                "headers": {"host": "ignored.invalid"},
            }))
            .await
            .into_result()
            .context("request failed")?;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["statusCode"], 201);
        assert_eq!(results[0]["headers"]["content-type"], "application/json");
        assert_eq!(results[1], json!({"ok": true}));
        Ok(())
    }

    #[tokio::test]
    async fn binary_bodies_are_base64() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xff, 0x00, 0x10]))
            .mount(&server)
            .await;

        let proxy = HttpProxy::default();
        let url = format!("{}/blob", server.uri());

        let results = proxy
            .send(json!(url))
            .await
            .into_result()
            .context("plain request")?;
        assert_eq!(results[1], json!("/wAQ"));

        let results = proxy
            .send(json!({"url": url, "encoding": null}))
            .await
            .into_result()
            .context("binary request")?;
        assert_eq!(results[1], json!("/wAQ"));
        assert_eq!(results[0]["body"], json!("/wAQ"));
        Ok(())
    }

    #[tokio::test]
    async fn network_errors_fill_the_error_slot() {
        let proxy = HttpProxy::default();
        let resolution = proxy.send(json!("http://127.0.0.1:1/unreachable")).await;
        let err = resolution.into_result().expect_err("connection refused");
        assert_eq!(err.kind(), ErrorKind::HostFunction);

        let resolution = proxy.send(json!({"method": "GET"})).await;
        assert!(resolution.is_error());
    }
}
