// Conduit — Declarative request templates
//
// An ability's HTTP call is data, not code: a method, a URL and header,
// query and body templates with `{{name}}` placeholders. Rendering fills
// placeholders from the call's params only; credentials are injected later
// by the sandbox and are never visible to a template.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use super::SandboxError;

/// A stored HTTP call with named placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTemplate {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A template after placeholder substitution, before credential injection.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RequestTemplate {
    /// A bare GET template.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
        }
    }

    /// Check the template's structure without rendering it.
    pub fn validate(&self) -> Result<(), SandboxError> {
        reqwest::Method::from_bytes(self.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| SandboxError::Template(format!("invalid HTTP method '{}'", self.method)))?;
        validate_template_url(&self.url)
    }

    /// Fill every placeholder from `params`.
    pub fn render(&self, params: &Map<String, Value>) -> Result<PreparedRequest, SandboxError> {
        self.validate()?;

        let raw_url = interpolate(&self.url, params, encode_path_value)?;
        let mut url = Url::parse(&raw_url).map_err(|e| SandboxError::InvalidUrl(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(SandboxError::InvalidUrl(format!(
                    "scheme '{}' is not allowed (only http/https)",
                    other
                )))
            }
        }

        if !self.query.is_empty() {
            let mut pairs = Vec::with_capacity(self.query.len());
            for (name, template) in &self.query {
                pairs.push((name.clone(), interpolate(template, params, str::to_string)?));
            }
            url.query_pairs_mut().extend_pairs(pairs);
        }

        let mut headers = Vec::with_capacity(self.headers.len());
        for (name, template) in &self.headers {
            let value = interpolate(template, params, str::to_string)?;
            set_header(&mut headers, name, value);
        }

        let body = match &self.body {
            Some(template) => Some(render_value(template, params)?),
            None => None,
        };

        Ok(PreparedRequest {
            method: self.method.trim().to_ascii_uppercase(),
            url,
            headers,
            body,
        })
    }
}

/// Insert or replace a header, matching names case-insensitively.
pub(crate) fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
        Some(entry) => entry.1 = value,
        None => headers.push((name.to_string(), value)),
    }
}

/// Reject placeholders in the URL scheme or host. Params must never choose
/// which server receives the injected credentials.
fn validate_template_url(template: &str) -> Result<(), SandboxError> {
    let (scheme, rest) = template.split_once("://").ok_or_else(|| {
        SandboxError::InvalidUrl("URL template must include a scheme (http:// or https://)".into())
    })?;
    if scheme.contains("{{") {
        return Err(SandboxError::InvalidUrl(
            "placeholder in the URL scheme is not allowed".into(),
        ));
    }

    let authority_end = rest.find(&['/', '?', '#'][..]).unwrap_or(rest.len());
    if rest[..authority_end].contains("{{") {
        return Err(SandboxError::InvalidUrl(
            "placeholder in the URL host is not allowed".into(),
        ));
    }
    Ok(())
}

/// Replace every `{{name}}` in `template`; `encode` is applied to each value.
fn interpolate(
    template: &str,
    params: &Map<String, Value>,
    encode: impl Fn(&str) -> String,
) -> Result<String, SandboxError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            SandboxError::Template(format!("unterminated placeholder in '{}'", template))
        })?;
        let name = after[..end].trim();
        out.push_str(&encode(&param_as_string(params, name)?));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn param_as_string(params: &Map<String, Value>, name: &str) -> Result<String, SandboxError> {
    match params.get(name) {
        None | Some(Value::Null) => Err(SandboxError::Template(format!(
            "missing parameter '{}'",
            name
        ))),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
    }
}

/// The name inside a string that is exactly one placeholder, e.g. `"{{limit}}"`.
fn sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn render_value(template: &Value, params: &Map<String, Value>) -> Result<Value, SandboxError> {
    match template {
        Value::String(s) => match sole_placeholder(s) {
            Some(name) => match params.get(name) {
                Some(v) if !v.is_null() => Ok(v.clone()),
                _ => Err(SandboxError::Template(format!("missing parameter '{}'", name))),
            },
            None => Ok(Value::String(interpolate(s, params, str::to_string)?)),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, params))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut rendered = Map::with_capacity(fields.len());
            for (k, v) in fields {
                rendered.insert(k.clone(), render_value(v, params)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set, so a
/// param cannot add path segments or a query string.
fn encode_path_value(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_render_fills_url_query_headers_and_body() {
        let template: RequestTemplate = serde_json::from_value(json!({
            "method": "post",
            "url": "https://api.x.com/2/users/{{userId}}/tweets",
            "headers": { "Content-Type": "application/json", "X-Trace": "t-{{trace}}" },
            "query": { "max_results": "{{limit}}" },
            "body": { "text": "{{text}}", "reply": { "to": "{{replyTo}}" }, "count": "{{limit}}" }
        }))
        .unwrap();

        let prepared = template
            .render(&params(json!({
                "userId": "42",
                "trace": "abc",
                "limit": 5,
                "text": "hello world",
                "replyTo": "7"
            })))
            .unwrap();

        assert_eq!(prepared.method, "POST");
        assert_eq!(
            prepared.url.as_str(),
            "https://api.x.com/2/users/42/tweets?max_results=5"
        );
        assert!(prepared
            .headers
            .contains(&("X-Trace".to_string(), "t-abc".to_string())));
        let body = prepared.body.unwrap();
        assert_eq!(body["text"], "hello world");
        assert_eq!(body["reply"]["to"], "7");
        assert_eq!(body["count"], json!(5), "Sole placeholders keep the JSON type");
    }

    #[test]
    fn test_missing_param_is_template_error() {
        let template = RequestTemplate::get("https://api.x.com/users/{{id}}");
        let err = template.render(&Map::new()).unwrap_err();
        assert!(matches!(err, SandboxError::Template(msg) if msg.contains("'id'")));
    }

    #[test]
    fn test_path_values_are_percent_encoded() {
        let template = RequestTemplate::get("https://api.x.com/files/{{name}}");
        let prepared = template
            .render(&params(json!({ "name": "../admin?x=1" })))
            .unwrap();
        assert_eq!(prepared.url.path(), "/files/..%2Fadmin%3Fx%3D1");
        assert!(prepared.url.query().is_none());

        let prepared = template
            .render(&params(json!({ "name": "résumé v2.pdf" })))
            .unwrap();
        assert_eq!(prepared.url.path(), "/files/r%C3%A9sum%C3%A9%20v2.pdf");
    }

    #[test]
    fn test_placeholder_in_host_is_rejected() {
        let template = RequestTemplate::get("https://{{host}}/v1/me");
        let err = template
            .render(&params(json!({ "host": "169.254.169.254" })))
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidUrl(_)));
    }

    #[test]
    fn test_placeholder_in_scheme_is_rejected() {
        let template = RequestTemplate::get("{{scheme}}://api.x.com/v1");
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_non_http_scheme_is_rejected() {
        let template = RequestTemplate::get("file:///etc/passwd");
        assert!(matches!(
            template.render(&Map::new()).unwrap_err(),
            SandboxError::InvalidUrl(_)
        ));
    }

    #[test]
    fn test_invalid_method_is_rejected() {
        let mut template = RequestTemplate::get("https://api.x.com");
        template.method = "GE T".to_string();
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_set_header_is_case_insensitive() {
        let mut headers = vec![("authorization".to_string(), "old".to_string())];
        set_header(&mut headers, "Authorization", "new".to_string());
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].1, "new");
    }

    #[test]
    fn test_unterminated_placeholder() {
        let mut template = RequestTemplate::get("https://api.x.com/v1");
        template
            .headers
            .insert("X-Broken".to_string(), "{{oops".to_string());
        assert!(template.render(&Map::new()).is_err());
    }
}
