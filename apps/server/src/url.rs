//! Request URL parsing for bundle entries and REST paths

use crate::Result;

/// A parsed relative FHIR request URL, e.g. `Patient/123/_history?_count=10`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParser {
    path: String,
    path_tokens: Vec<String>,
    query: Option<String>,
    query_parameters: Vec<(String, Vec<String>)>,
}

impl UrlParser {
    pub fn parse(url: &str) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(crate::Error::InvalidArgument(
                "The request URL must not be empty".to_string(),
            ));
        }

        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (url, None),
        };

        // Leading and trailing slashes are dropped; empty interior tokens are kept.
        let path = path.trim_matches('/').to_string();
        let path_tokens = if path.is_empty() {
            Vec::new()
        } else {
            path.split('/').map(str::to_string).collect()
        };

        let query_parameters = query
            .as_deref()
            .map(parse_query_string)
            .unwrap_or_default();

        Ok(Self {
            path,
            path_tokens,
            query,
            query_parameters,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn path_tokens(&self) -> &[String] {
        &self.path_tokens
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn has_query(&self) -> bool {
        self.query.as_deref().is_some_and(|q| !q.is_empty())
    }

    /// Query parameters in first-seen order, each with all of its values.
    pub fn query_parameters(&self) -> &[(String, Vec<String>)] {
        &self.query_parameters
    }

    /// Flattened `(name, value)` pairs in request order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query_parameters
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.clone(), v.clone())))
            .collect()
    }

    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.query_parameters
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    /// Operation name if the last path token is `$name`.
    pub fn operation_name(&self) -> Option<&str> {
        self.path_tokens.last()?.strip_prefix('$')
    }
}

/// Parse `a=1&b=2&a=3` into an order-preserving multimap.
pub fn parse_query_string(query: &str) -> Vec<(String, Vec<String>)> {
    let mut params: Vec<(String, Vec<String>)> = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (raw_name, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = decode_component(raw_name);
        let value = decode_component(raw_value);
        match params.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => params.push((name, vec![value])),
        }
    }
    params
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_and_query() {
        let parsed = UrlParser::parse("Patient/123/_history?_count=10&_since=2024").unwrap();
        assert_eq!(parsed.path(), "Patient/123/_history");
        assert_eq!(parsed.path_tokens(), ["Patient", "123", "_history"]);
        assert_eq!(parsed.query(), Some("_count=10&_since=2024"));
        assert_eq!(parsed.first_value("_count"), Some("10"));
    }

    #[test]
    fn interior_empty_tokens_are_kept() {
        let parsed = UrlParser::parse("Patient//123").unwrap();
        assert_eq!(parsed.path_tokens(), ["Patient", "", "123"]);
        assert_eq!(UrlParser::parse("/Patient/").unwrap().path_tokens(), ["Patient"]);
        assert!(UrlParser::parse("?_id=1").unwrap().path_tokens().is_empty());
    }

    #[test]
    fn repeated_parameters_keep_order() {
        let parsed = UrlParser::parse("Observation?code=a&subject=Patient/1&code=b").unwrap();
        let params = parsed.query_parameters();
        assert_eq!(params[0].0, "code");
        assert_eq!(params[0].1, vec!["a", "b"]);
        assert_eq!(params[1].0, "subject");
        assert_eq!(
            parsed.query_pairs(),
            vec![
                ("code".to_string(), "a".to_string()),
                ("code".to_string(), "b".to_string()),
                ("subject".to_string(), "Patient/1".to_string()),
            ]
        );
    }

    #[test]
    fn decodes_percent_and_plus() {
        let parsed =
            UrlParser::parse("Patient?identifier=http%3A%2F%2Facme.org%7C123&name=John+Doe")
                .unwrap();
        assert_eq!(
            parsed.first_value("identifier"),
            Some("http://acme.org|123")
        );
        assert_eq!(parsed.first_value("name"), Some("John Doe"));
    }

    #[test]
    fn empty_url_is_invalid_argument() {
        assert!(matches!(
            UrlParser::parse(""),
            Err(crate::Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn operation_name_from_last_token() {
        let parsed = UrlParser::parse("Patient/1/$everything").unwrap();
        assert_eq!(parsed.operation_name(), Some("everything"));
        assert!(!UrlParser::parse("Patient").unwrap().has_query());
        assert!(!UrlParser::parse("Patient?").unwrap().has_query());
    }
}
