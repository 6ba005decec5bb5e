use url::Url;

/// Replaces every query value of `raw` with `*****` so API keys embedded in
/// the URL never reach a log line. Unparseable input is masked entirely.
pub fn redact_url(raw: &str) -> String {
    let mut url = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => return "<unparseable url>".to_string(),
    };

    if url.password().is_some() {
        let _ = url.set_password(Some("*****"));
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, _)| (k.into_owned(), "*****".to_string()))
        .collect();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    url.to_string()
}
