use feed_rs::parser;
use serde_json::{Map, Value};
use url::Url;

use super::fetcher::FetchedFeed;
use crate::storage::FeedMeta;

fn text_value(text: Option<feed_rs::model::Text>) -> Option<Value> {
    text.map(|t| Value::String(t.content))
}

fn put(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(v) = value {
        map.insert(key.to_owned(), v);
    }
}

/// Convert raw RSS/Atom bytes into a [`FetchedFeed`].
///
/// Entries become opaque JSON maps with `id`, `title`, `link`, `summary`,
/// `content`, `published`, `updated` and `author` where present. An entry
/// whose link is not a valid absolute URL keeps everything but the link and
/// the feed is returned with a recoverable warning.
pub fn parse_feed(bytes: &[u8]) -> Result<FetchedFeed, parser::ParseFeedError> {
    let feed = parser::parse(bytes)?;

    let mut meta = FeedMeta {
        title: feed.title.map(|t| t.content),
        fields: Map::new(),
    };
    put(
        &mut meta.fields,
        "link",
        feed.links.first().map(|l| Value::String(l.href.clone())),
    );
    put(&mut meta.fields, "description", text_value(feed.description));

    let mut bad_links = 0usize;
    let entries: Vec<Map<String, Value>> = feed
        .entries
        .into_iter()
        .map(|entry| {
            let mut fields = Map::new();
            if !entry.id.trim().is_empty() {
                fields.insert("id".into(), Value::String(entry.id.trim().to_owned()));
            }
            put(&mut fields, "title", text_value(entry.title));

            if let Some(link) = entry.links.first() {
                if Url::parse(&link.href).is_ok() {
                    fields.insert("link".into(), Value::String(link.href.clone()));
                } else {
                    bad_links += 1;
                }
            }

            put(&mut fields, "summary", text_value(entry.summary));
            put(
                &mut fields,
                "content",
                entry.content.and_then(|c| c.body).map(Value::String),
            );
            put(
                &mut fields,
                "published",
                entry.published.map(|dt| Value::String(dt.to_rfc3339())),
            );
            put(
                &mut fields,
                "updated",
                entry.updated.map(|dt| Value::String(dt.to_rfc3339())),
            );
            put(
                &mut fields,
                "author",
                entry.authors.first().map(|p| Value::String(p.name.clone())),
            );
            fields
        })
        .collect();

    let warning =
        (bad_links > 0).then(|| format!("{} entries with invalid links, links dropped", bad_links));

    Ok(FetchedFeed {
        meta,
        entries,
        warning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example Feed</title>
    <link>https://example.com/</link>
    <item><guid>g-1</guid><title>First</title><link>https://example.com/1</link></item>
    <item><guid>g-2</guid><title>Second</title><description>Body</description></item>
</channel></rss>"#;

    #[test]
    fn test_parse_rss() {
        let fetched = parse_feed(RSS.as_bytes()).unwrap();
        assert_eq!(fetched.meta.title.as_deref(), Some("Example Feed"));
        assert_eq!(fetched.entries.len(), 2);
        assert_eq!(fetched.entries[0]["id"], "g-1");
        assert_eq!(fetched.entries[0]["link"], "https://example.com/1");
        assert_eq!(fetched.entries[1]["summary"], "Body");
        assert!(fetched.warning.is_none());
    }

    #[test]
    fn test_invalid_link_is_recoverable() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title>
    <item><guid>1</guid><title>Broken</title><link>not a url</link></item>
</channel></rss>"#;
        let fetched = parse_feed(rss.as_bytes()).unwrap();
        assert_eq!(fetched.entries.len(), 1);
        assert!(!fetched.entries[0].contains_key("link"));
        assert!(fetched.warning.unwrap().contains("invalid links"));
    }

    #[test]
    fn test_malformed_is_error() {
        assert!(parse_feed(b"<not valid xml").is_err());
    }
}
