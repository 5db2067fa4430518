use super::{Feed, FeedError, FeedItem};
use anyhow::{Context, Result};
use quick_xml::escape::escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;
use std::path::Path;

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn xml_err(e: impl std::fmt::Display) -> FeedError {
    FeedError::Xml(e.to_string())
}

fn write_text_element(writer: &mut XmlWriter, name: &str, text: &str) -> Result<(), FeedError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)?;
    Ok(())
}

/// HTML list of the posts that shared the link.
fn item_description(item: &FeedItem) -> String {
    let mut html = String::from("<ul>");
    for post in &item.posts {
        html.push_str("<li>");
        if !post.author.is_empty() {
            html.push_str("<b>@");
            html.push_str(&escape(post.author.as_str()));
            html.push_str("</b>: ");
        }
        html.push_str(&escape(post.text.as_str()));
        html.push_str("</li>");
    }
    html.push_str("</ul>");
    html
}

fn write_item(writer: &mut XmlWriter, item: &FeedItem) -> Result<(), FeedError> {
    writer
        .write_event(Event::Start(BytesStart::new("item")))
        .map_err(xml_err)?;

    write_text_element(writer, "title", &item.title)?;
    write_text_element(writer, "link", &item.address)?;
    write_text_element(writer, "description", &item_description(item))?;
    write_text_element(writer, "pubDate", &item.last_active.to_rfc2822())?;

    let mut guid = BytesStart::new("guid");
    guid.push_attribute(("isPermaLink", "false"));
    writer.write_event(Event::Start(guid)).map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(&item.guid)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("guid")))
        .map_err(xml_err)?;

    writer
        .write_event(Event::End(BytesEnd::new("item")))
        .map_err(xml_err)?;
    Ok(())
}

/// Serializes `feed` as an RSS 2.0 document.
///
/// Items keep the order they have in `feed`. Text is XML-escaped by the
/// writer, so descriptions arrive as escaped HTML.
pub fn render_rss(feed: &Feed) -> Result<String, FeedError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "2.0"));
    writer.write_event(Event::Start(rss)).map_err(xml_err)?;
    writer
        .write_event(Event::Start(BytesStart::new("channel")))
        .map_err(xml_err)?;

    write_text_element(&mut writer, "title", &feed.title)?;
    write_text_element(&mut writer, "link", &feed.link)?;
    write_text_element(&mut writer, "description", &feed.description)?;
    write_text_element(&mut writer, "lastBuildDate", &feed.generated_at.to_rfc2822())?;
    write_text_element(
        &mut writer,
        "generator",
        concat!("linkharvest ", env!("CARGO_PKG_VERSION")),
    )?;

    for item in &feed.items {
        write_item(&mut writer, item)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("channel")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("rss")))
        .map_err(xml_err)?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(xml_err)
}

/// Writes `content` to `path` through a temp file and rename, so readers
/// never see a partial feed.
pub fn write_to_file(content: &str, path: &Path) -> Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    // Unpredictable temp name; create_new refuses to follow a planted symlink
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .with_context(|| {
            format!(
                "Failed to create temporary file '{}': check directory permissions",
                temp_path.display()
            )
        })?;

    std::io::Write::write_all(&mut file, content.as_bytes()).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!("Failed to write feed to '{}'", temp_path.display())
    })?;

    file.sync_all().with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!("Failed to sync '{}' to disk", temp_path.display())
    })?;

    drop(file);

    std::fs::rename(&temp_path, path).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to rename '{}' to '{}'",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
