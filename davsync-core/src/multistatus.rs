use quick_xml::Reader;
use quick_xml::events::Event;

pub(crate) const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getetag/>
  </d:prop>
</d:propfind>
"#;

/// One `<response>` element of a `207 Multi-Status` body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DavResponse {
    pub href: String,
    pub is_collection: bool,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Href,
    Etag,
}

/// Parses a PROPFIND answer. Namespace prefixes differ between servers, so
/// elements are matched by local name only.
pub(crate) fn parse_multistatus(body: &str) -> Result<Vec<DavResponse>, quick_xml::Error> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut out = Vec::new();
    let mut current: Option<DavResponse> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"response" => current = Some(DavResponse::default()),
                b"href" => field = Some(Field::Href),
                b"getetag" => field = Some(Field::Etag),
                b"collection" => {
                    if let Some(response) = current.as_mut() {
                        response.is_collection = true;
                    }
                }
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection"
                    && let Some(response) = current.as_mut()
                {
                    response.is_collection = true;
                }
            }
            Event::Text(text) => {
                if let (Some(field), Some(response)) = (field, current.as_mut()) {
                    let value = text.unescape()?;
                    match field {
                        Field::Href => response.href.push_str(&value),
                        Field::Etag => {
                            let etag = normalize_etag(&value);
                            if !etag.is_empty() {
                                response.etag = Some(etag);
                            }
                        }
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(response) = current.take() {
                        out.push(response);
                    }
                }
                b"href" | b"getetag" => field = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(out)
}

/// Strips the weak marker and surrounding quotes so tags from `PROPFIND`
/// and from `ETag` response headers compare equal.
pub fn normalize_etag(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("W/").unwrap_or(trimmed);
    trimmed.trim_matches('"').to_string()
}
