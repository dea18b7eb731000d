//! Parameter encoders.
//!
//! A [`ParameterEncoder`] applies a parameter map to a [`UrlRequest`]. Two
//! encoders are provided: [`UrlEncoding`] writes `key=value` pairs into the
//! query string or a form body, [`JsonEncoding`] writes a JSON body.

use http::header::CONTENT_TYPE;
use http::HeaderValue;
use serde_json::Value;
use url::form_urlencoded;

use super::request::UrlRequest;
use crate::error::{CourierError, Result};

/// Request parameters, as a JSON object.
pub type Parameters = serde_json::Map<String, Value>;

/// Applies parameters to a request.
pub trait ParameterEncoder: Send + Sync {
    /// Return `request` with `parameters` encoded into it.
    fn encode(&self, request: UrlRequest, parameters: Option<&Parameters>) -> Result<UrlRequest>;
}

/// Where [`UrlEncoding`] places the encoded string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UrlEncodingDestination {
    /// Query string for GET, HEAD and DELETE, form body otherwise.
    #[default]
    MethodDependent,
    /// Always the query string.
    QueryString,
    /// Always the body.
    HttpBody,
}

/// How array values are keyed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArrayEncoding {
    /// `key[]=a&key[]=b`
    #[default]
    Brackets,
    /// `key=a&key=b`
    NoBrackets,
    /// `key[0]=a&key[1]=b`
    IndexInBrackets,
}

/// How boolean values are written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BoolEncoding {
    /// `1` and `0`
    #[default]
    Numeric,
    /// `true` and `false`
    Literal,
}

/// URL-encodes parameters into the query string or a form body.
///
/// Keys are emitted in sorted order. Nested objects become `key[sub]=value`.
#[derive(Clone, Copy, Debug, Default)]
pub struct UrlEncoding {
    /// Where the encoded string goes.
    pub destination: UrlEncodingDestination,
    /// Array key style.
    pub array_encoding: ArrayEncoding,
    /// Boolean style.
    pub bool_encoding: BoolEncoding,
}

impl UrlEncoding {
    /// Always encode into the query string.
    pub fn query_string() -> Self {
        Self {
            destination: UrlEncodingDestination::QueryString,
            ..Self::default()
        }
    }

    /// Always encode into the body.
    pub fn http_body() -> Self {
        Self {
            destination: UrlEncodingDestination::HttpBody,
            ..Self::default()
        }
    }

    /// Encode parameters into a `key=value&...` string.
    pub fn query(&self, parameters: &Parameters) -> String {
        let mut keys: Vec<&String> = parameters.keys().collect();
        keys.sort();

        let mut components = Vec::new();
        for key in keys {
            self.components(key, &parameters[key], &mut components);
        }

        components
            .into_iter()
            .map(|(key, value)| format!("{}={}", escape(&key), escape(&value)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn components(&self, key: &str, value: &Value, out: &mut Vec<(String, String)>) {
        match value {
            Value::Object(map) => {
                let mut nested: Vec<&String> = map.keys().collect();
                nested.sort();
                for nested_key in nested {
                    self.components(&format!("{key}[{nested_key}]"), &map[nested_key], out);
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    let item_key = match self.array_encoding {
                        ArrayEncoding::Brackets => format!("{key}[]"),
                        ArrayEncoding::NoBrackets => key.to_string(),
                        ArrayEncoding::IndexInBrackets => format!("{key}[{index}]"),
                    };
                    self.components(&item_key, item, out);
                }
            }
            Value::Bool(flag) => {
                let encoded = match (self.bool_encoding, flag) {
                    (BoolEncoding::Numeric, true) => "1",
                    (BoolEncoding::Numeric, false) => "0",
                    (BoolEncoding::Literal, true) => "true",
                    (BoolEncoding::Literal, false) => "false",
                };
                out.push((key.to_string(), encoded.to_string()));
            }
            Value::Number(number) => out.push((key.to_string(), number.to_string())),
            Value::String(text) => out.push((key.to_string(), text.clone())),
            Value::Null => out.push((key.to_string(), String::new())),
        }
    }

    fn encodes_in_url(&self, request: &UrlRequest) -> bool {
        match self.destination {
            UrlEncodingDestination::MethodDependent => request.method.encodes_parameters_in_url(),
            UrlEncodingDestination::QueryString => true,
            UrlEncodingDestination::HttpBody => false,
        }
    }
}

fn escape(component: &str) -> String {
    form_urlencoded::byte_serialize(component.as_bytes()).collect()
}

impl ParameterEncoder for UrlEncoding {
    fn encode(&self, mut request: UrlRequest, parameters: Option<&Parameters>) -> Result<UrlRequest> {
        let Some(parameters) = parameters else {
            return Ok(request);
        };

        let encoded = self.query(parameters);
        if self.encodes_in_url(&request) {
            if !encoded.is_empty() {
                let query = match request.url.query() {
                    Some(existing) if !existing.is_empty() => format!("{existing}&{encoded}"),
                    _ => encoded,
                };
                request.url.set_query(Some(&query));
            }
        } else {
            if !request.headers.contains_key(CONTENT_TYPE) {
                request.headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded; charset=utf-8"),
                );
            }
            request.body = Some(encoded.into_bytes().into());
        }
        Ok(request)
    }
}

/// Encodes parameters as a JSON body.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonEncoding {
    /// Pretty-print the body.
    pub pretty: bool,
}

impl JsonEncoding {
    /// Encoder that pretty-prints.
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl ParameterEncoder for JsonEncoding {
    fn encode(&self, mut request: UrlRequest, parameters: Option<&Parameters>) -> Result<UrlRequest> {
        let Some(parameters) = parameters else {
            return Ok(request);
        };

        let body = if self.pretty {
            serde_json::to_vec_pretty(parameters)
        } else {
            serde_json::to_vec(parameters)
        }
        .map_err(|e| CourierError::ParameterEncodingFailed(e.to_string()))?;

        if !request.headers.contains_key(CONTENT_TYPE) {
            request
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        request.body = Some(body.into());
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    fn request(method: HttpMethod, url: &str) -> UrlRequest {
        UrlRequest::parse(method, url).unwrap()
    }

    #[test]
    fn test_query_components_sorted_and_nested() {
        let encoding = UrlEncoding::default();
        let query = encoding.query(&params(json!({
            "b": "two words",
            "a": 1,
            "nested": {"y": true, "x": false},
            "list": [1, 2]
        })));
        assert_eq!(
            query,
            "a=1&b=two+words&list%5B%5D=1&list%5B%5D=2&nested%5Bx%5D=0&nested%5By%5D=1"
        );
    }

    #[test]
    fn test_array_and_bool_styles() {
        let encoding = UrlEncoding {
            array_encoding: ArrayEncoding::NoBrackets,
            bool_encoding: BoolEncoding::Literal,
            ..UrlEncoding::default()
        };
        let query = encoding.query(&params(json!({"flag": true, "ids": ["a", "b"]})));
        assert_eq!(query, "flag=true&ids=a&ids=b");

        let indexed = UrlEncoding {
            array_encoding: ArrayEncoding::IndexInBrackets,
            ..UrlEncoding::default()
        };
        assert_eq!(
            indexed.query(&params(json!({"ids": ["a"]}))),
            "ids%5B0%5D=a"
        );
    }

    #[test]
    fn test_method_dependent_destination() {
        let parameters = params(json!({"q": "rust"}));
        let get = UrlEncoding::default()
            .encode(request(HttpMethod::Get, "https://example.com/s?x=1"), Some(&parameters))
            .unwrap();
        assert_eq!(get.url.query(), Some("x=1&q=rust"));
        assert!(get.body.is_none());

        let post = UrlEncoding::default()
            .encode(request(HttpMethod::Post, "https://example.com/s"), Some(&parameters))
            .unwrap();
        assert_eq!(post.url.query(), None);
        assert_eq!(post.body.as_deref(), Some(&b"q=rust"[..]));
        assert_eq!(
            post.header("content-type"),
            Some("application/x-www-form-urlencoded; charset=utf-8")
        );
    }

    #[test]
    fn test_json_encoding_keeps_existing_content_type() {
        let parameters = params(json!({"name": "courier"}));
        let plain = JsonEncoding::default()
            .encode(request(HttpMethod::Post, "https://example.com"), Some(&parameters))
            .unwrap();
        assert_eq!(plain.header("content-type"), Some("application/json"));
        let body: Value = serde_json::from_slice(plain.body.as_ref().unwrap()).unwrap();
        assert_eq!(body, json!({"name": "courier"}));

        let custom = request(HttpMethod::Post, "https://example.com")
            .with_header("Content-Type", "application/vnd.api+json")
            .unwrap();
        let encoded = JsonEncoding::default().encode(custom, Some(&parameters)).unwrap();
        assert_eq!(encoded.header("content-type"), Some("application/vnd.api+json"));
    }

    #[test]
    fn test_no_parameters_is_identity() {
        let original = request(HttpMethod::Post, "https://example.com");
        let encoded = JsonEncoding::default().encode(original.clone(), None).unwrap();
        assert_eq!(encoded, original);
    }
}
