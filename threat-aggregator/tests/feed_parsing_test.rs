mod common;

use threat_aggregator::{normalize, FeedParser, Result};
use tracing::info;

const RSS_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
  <channel>
    <title>Security Feed</title>
    <link>https://security.test/</link>
    <description>Threat research</description>
    <item>
      <title>New loader drops backdoor</title>
      <link>https://security.test/loader</link>
      <pubDate>Tue, 14 May 2024 09:30:00 +0000</pubDate>
      <description>Short teaser</description>
      <content:encoded><![CDATA[<p>The loader contacts <b>185.220.101.47</b>.</p>]]></content:encoded>
    </item>
    <item>
      <title>Repost of the loader story</title>
      <link>https://security.test/loader</link>
      <description>Same link again</description>
    </item>
    <item>
      <title>Item with no link</title>
      <description>Cannot be keyed</description>
    </item>
    <item>
      <title>Phishing wave</title>
      <link>https://security.test/phishing</link>
      <description>&lt;p&gt;Credential phishing&lt;/p&gt;</description>
    </item>
  </channel>
</rss>"#;

const ATOM_FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Security</title>
  <id>urn:uuid:60a76c80-d399-11d9-b93C-0003939e0af6</id>
  <updated>2024-06-01T12:00:00Z</updated>
  <entry>
    <title>Exploit chain analysis</title>
    <link href="https://atom.test/chain"/>
    <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
    <updated>2024-06-01T12:00:00Z</updated>
    <author><name>Analyst One</name></author>
    <content type="html">&lt;p&gt;Chain uses CVE-2024-3400&lt;/p&gt;</content>
  </entry>
</feed>"#;

const BROKEN_FEED: &str = r#"<channel>
  <item>
    <title>Salvaged &amp; readable</title>
    <link>https://broken.test/one</link>
    <pubDate>Tue, 14 May 2024 09:30:00 +0000</pubDate>
    <description><![CDATA[<p>Payload at 45.33.32.156</p>]]></description>
    <dc:creator>Researcher</dc:creator>
  </item>
  <entry>
    <title>Atom style</title>
    <link rel="alternate" href="https://broken.test/two"/>
    <summary>Summary text</summary>
  </entry>
</channel>"#;

#[tokio::test]
async fn test_rss_entries_deduplicated_by_link() -> Result<()> {
    common::init_tracing();

    let parsed = FeedParser::new().parse_feed(RSS_FEED)?;
    info!("Parsed {} entries", parsed.entries.len());

    assert!(!parsed.salvaged);
    assert_eq!(parsed.title.as_deref(), Some("Security Feed"));

    let links: Vec<_> = parsed.entries.iter().filter_map(|e| e.link.as_deref()).collect();
    assert_eq!(links, vec!["https://security.test/loader", "https://security.test/phishing"]);

    let first = normalize(&parsed.entries[0], "security");
    assert_eq!(first.title, "New loader drops backdoor");
    assert_eq!(first.body, "The loader contacts 185.220.101.47.");
    assert!(first.published_at.is_some());

    let second = normalize(&parsed.entries[1], "security");
    assert_eq!(second.body, "Credential phishing");

    Ok(())
}

#[tokio::test]
async fn test_atom_entries() -> Result<()> {
    common::init_tracing();

    let parsed = FeedParser::new().parse_feed(ATOM_FEED)?;
    assert_eq!(parsed.entries.len(), 1);

    let entry = normalize(&parsed.entries[0], "atom");
    assert_eq!(entry.url, "https://atom.test/chain");
    assert_eq!(entry.author, "Analyst One");
    assert_eq!(entry.body, "Chain uses CVE-2024-3400");
    assert!(entry.published_at.is_some());

    Ok(())
}

#[tokio::test]
async fn test_malformed_feed_salvaged() -> Result<()> {
    common::init_tracing();

    let parsed = FeedParser::new().parse_feed(BROKEN_FEED)?;
    assert!(parsed.salvaged);
    assert_eq!(parsed.entries.len(), 2);

    let first = normalize(&parsed.entries[0], "broken");
    assert_eq!(first.title, "Salvaged & readable");
    assert_eq!(first.url, "https://broken.test/one");
    assert_eq!(first.author, "Researcher");
    assert_eq!(first.body, "Payload at 45.33.32.156");
    assert!(first.published_at.is_some());

    let second = normalize(&parsed.entries[1], "broken");
    assert_eq!(second.url, "https://broken.test/two");
    assert_eq!(second.body, "Summary text");

    Ok(())
}

#[tokio::test]
async fn test_unreadable_content_is_error() -> Result<()> {
    common::init_tracing();

    assert!(FeedParser::new().parse_feed("definitely not a feed").is_err());

    Ok(())
}

#[tokio::test]
async fn test_entry_cap() -> Result<()> {
    common::init_tracing();

    let parsed = FeedParser::new().with_max_entries(1).parse_feed(RSS_FEED)?;
    assert_eq!(parsed.entries.len(), 1);

    Ok(())
}
