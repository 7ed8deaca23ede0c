use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::{Map, Value};

use super::Error;

/// Outbound request as described by a script.
///
/// Accepts either a bare URL string or an object with `url` (or `uri`),
/// `method`, `headers`, `body`, `json`, `encoding` and `timeout` (ms).
#[derive(Debug)]
pub struct HttpOptions {
    pub url: url::Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    /// Parse the response body as JSON.
    pub json: bool,
    /// `encoding: null` asks for the raw bytes, returned as base64.
    pub binary: bool,
    pub timeout: Option<Duration>,
}

impl HttpOptions {
    pub fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::String(url) => Self::from_url(&url),
            Value::Object(map) => Self::from_map(map),
            other => Err(Error::Options(format!(
                "expected a URL or an options object, got {other}"
            ))),
        }
    }

    fn from_url(url: &str) -> Result<Self, Error> {
        Ok(Self {
            url: url::Url::parse(url)?,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            json: false,
            binary: false,
            timeout: None,
        })
    }

    fn from_map(mut map: Map<String, Value>) -> Result<Self, Error> {
        let url = match map.remove("url").or_else(|| map.remove("uri")) {
            Some(Value::String(url)) => url,
            _ => return Err(Error::Options("missing `url`".to_string())),
        };
        let mut options = Self::from_url(&url)?;

        if let Some(Value::String(method)) = map.get("method") {
            options.method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|e| Error::Options(format!("method: {e}")))?;
        }

        if let Some(Value::Object(headers)) = map.get("headers") {
            for (name, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| Error::Options(format!("header `{name}`: {e}")))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| Error::Options(format!("header `{name}`: {e}")))?;
                options.headers.append(name, value);
            }
        }

        options.json = matches!(map.get("json"), Some(Value::Bool(true)));
        options.binary = matches!(map.get("encoding"), Some(Value::Null));
        options.timeout = map
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);

        match map.remove("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(body)) => options.body = Some(body.into_bytes()),
            Some(other) => {
                options.body = Some(other.to_string().into_bytes());
                if !options.headers.contains_key(http::header::CONTENT_TYPE) {
                    options.headers.insert(
                        http::header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                }
            }
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use http::Method;
    use serde_json::json;

    use super::HttpOptions;

    #[test]
    fn bare_url() {
        let options = HttpOptions::from_value(json!("http://example.com/a")).expect("options");
        assert_eq!(options.method, Method::GET);
        assert_eq!(options.url.path(), "/a");
        assert!(options.body.is_none());
    }

    #[test]
    fn object_body_is_sent_as_json() {
        let options = HttpOptions::from_value(json!({
            "uri": "http://example.com",
            "method": "post",
            "body": {"a": 1},
            "encoding": null,
            "timeout": 250,
        }))
        .expect("options");
        assert_eq!(options.method, Method::POST);
        assert_eq!(options.body.as_deref(), Some(br#"{"a":1}"#.as_slice()));
        assert_eq!(options.headers["content-type"], "application/json");
        assert!(options.binary);
        assert_eq!(options.timeout, Some(std::time::Duration::from_millis(250)));
    }

    #[test]
    fn rejects_missing_url() {
        assert!(HttpOptions::from_value(json!({"method": "GET"})).is_err());
        assert!(HttpOptions::from_value(json!(42)).is_err());
        assert!(HttpOptions::from_value(json!("not a url")).is_err());
    }
}
