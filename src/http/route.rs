use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Method;
use std::fmt;

use super::error::{HttpError, Result};

/// Parameters that partition a bucket: the same route shape against two channels
/// gets two independent budgets.
const MAJOR_PARAMETERS: [&str; 4] = ["channel_id", "guild_id", "webhook_id", "webhook_token"];

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// An API endpoint: method plus URL template, with the values to substitute into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    method: Method,
    template: String,
    params: Vec<(String, String)>,
}

impl Route {
    pub fn new(method: Method, template: impl Into<String>) -> Self {
        Self {
            method,
            template: template.into(),
            params: Vec::new(),
        }
    }

    pub fn get(template: impl Into<String>) -> Self {
        Self::new(Method::GET, template)
    }

    pub fn post(template: impl Into<String>) -> Self {
        Self::new(Method::POST, template)
    }

    pub fn patch(template: impl Into<String>) -> Self {
        Self::new(Method::PATCH, template)
    }

    pub fn delete(template: impl Into<String>) -> Self {
        Self::new(Method::DELETE, template)
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// `"<METHOD> <template>"`, shared by every request to the same route shape
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.template)
    }

    pub fn major_parameters(&self) -> String {
        MAJOR_PARAMETERS
            .iter()
            .filter_map(|name| {
                self.params
                    .iter()
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| value.as_str())
            })
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Template with every `{name}` replaced by its percent-encoded value
    pub fn path(&self) -> Result<String> {
        let mut path = self.template.clone();
        for (name, value) in &self.params {
            let placeholder = format!("{{{name}}}");
            let encoded = utf8_percent_encode(value, PATH_SEGMENT).to_string();
            path = path.replace(&placeholder, &encoded);
        }
        if path.contains('{') {
            return Err(HttpError::InvalidRequest(format!(
                "unfilled parameter in {}",
                self.template
            )));
        }
        Ok(path)
    }

    pub fn url(&self, base: &str, query: &[(String, String)]) -> Result<String> {
        let raw = format!("{}{}", base.trim_end_matches('/'), self.path()?);
        let url = if query.is_empty() {
            reqwest::Url::parse(&raw)
        } else {
            reqwest::Url::parse_with_params(&raw, query)
        }
        .map_err(|e| HttpError::InvalidRequest(format!("{raw}: {e}")))?;
        Ok(url.into())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ignores_values() {
        let a = Route::get("/channels/{channel_id}/messages").param("channel_id", 1);
        let b = Route::get("/channels/{channel_id}/messages").param("channel_id", 2);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.major_parameters(), b.major_parameters());
    }

    #[test]
    fn test_major_parameters_order() {
        let route = Route::delete("/guilds/{guild_id}/channels/{channel_id}/x/{message_id}")
            .param("message_id", 9)
            .param("guild_id", 7)
            .param("channel_id", 8);
        assert_eq!(route.major_parameters(), "8+7");
    }

    #[test]
    fn test_url_building() {
        let route = Route::get("/channels/{channel_id}/messages").param("channel_id", "12 34");
        let url = route
            .url("https://api.example/v10/", &[("limit".to_string(), "50".to_string())])
            .unwrap();
        assert_eq!(url, "https://api.example/v10/channels/12%2034/messages?limit=50");
    }

    #[test]
    fn test_unfilled_parameter() {
        let route = Route::get("/guilds/{guild_id}");
        assert!(matches!(route.path(), Err(HttpError::InvalidRequest(_))));
    }
}
