//! DIDL-Lite rendering for Browse responses.

use crate::dirlist::{Entry, EntryKind};
use crate::util::mime::MimeClass;
use crate::util::xml::xml_escape_double;

fn upnp_item_class(class: MimeClass) -> &'static str {
    match class {
        MimeClass::Video => "object.item.videoItem",
        MimeClass::Audio => "object.item.audioItem",
        MimeClass::Image => "object.item.imageItem",
        MimeClass::Text => "object.item.textItem",
    }
}

/// `DLNA.ORG_OP=01;DLNA.ORG_CI=0;DLNA.ORG_FLAGS=...` as specified,
/// used verbatim for every rendered `<res>` protocolInfo.
const RES_DLNA_SUFFIX: &str =
    "DLNA.ORG_OP=01;DLNA.ORG_CI=0;DLNA.ORG_FLAGS=01700000000000000000000000000000";

/// Renders the DIDL-Lite document for one directory window, already in
/// the form that belongs verbatim inside a SOAP `<Result>` text node:
/// structural tags are written single-escaped (`&lt;container`,
/// `&gt;`), with their attribute quotes left as literal `"` since those
/// don't need escaping inside XML character data. Only the dynamic
/// values (ids, titles, the item URL) are escaped, and double-escaped,
/// since a client recovers them by unescaping the `<Result>` text
/// exactly once and then parsing what's left as DIDL-Lite. `parent_id`
/// and `dir_path` are raw, unescaped id strings (root is the empty
/// string, per the `"0"` request id normalisation).
pub fn render_didl(parent_id: &str, dir_path: &str, entries: &[Entry], host: &str) -> String {
    let mut out = String::from(
        "&lt;DIDL-Lite xmlns=\"urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/\" xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:upnp=\"urn:schemas-upnp-org:metadata-1-0/upnp/\"&gt;",
    );

    for entry in entries {
        let child_path = if dir_path.is_empty() {
            entry.name.clone()
        } else {
            format!("{dir_path}/{}", entry.name)
        };
        let id = xml_escape_double(&child_path);
        let parent = xml_escape_double(parent_id);
        let title = xml_escape_double(&entry.name);

        match entry.kind {
            EntryKind::Directory => {
                out.push_str(&format!(
                    "&lt;container id=\"{id}\" parentID=\"{parent}\" restricted=\"1\" searchable=\"0\"&gt;\
                     &lt;dc:title&gt;{title}&lt;/dc:title&gt;\
                     &lt;upnp:class&gt;object.container.storageFolder&lt;/upnp:class&gt;\
                     &lt;upnp:storageUsed&gt;-1&lt;/upnp:storageUsed&gt;\
                     &lt;/container&gt;"
                ));
            }
            EntryKind::File => {
                let Some((class, sub)) = entry.mime else { continue };
                let url = xml_escape_double(&format!(
                    "http://{host}/MediaItems/{}",
                    crate::util::path::url_escape(&child_path)
                ));
                out.push_str(&format!(
                    "&lt;item id=\"{id}\" parentID=\"{parent}\" restricted=\"1\"&gt;\
                     &lt;dc:title&gt;{title}&lt;/dc:title&gt;\
                     &lt;upnp:class&gt;{upnp_class}&lt;/upnp:class&gt;\
                     &lt;res protocolInfo=\"http-get:*:{major}/{sub}:{dlna}\" size=\"{size}\"&gt;{url}&lt;/res&gt;\
                     &lt;/item&gt;",
                    upnp_class = upnp_item_class(class),
                    major = class.as_str(),
                    sub = sub,
                    dlna = RES_DLNA_SUFFIX,
                    size = entry.size,
                ));
            }
        }
    }

    out.push_str("&lt;/DIDL-Lite&gt;");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::xml::xml_unescape;

    #[test]
    fn container_and_item_shapes() {
        let entries = vec![
            Entry { name: "Music".into(), kind: EntryKind::Directory, size: 0, mime: None },
            Entry {
                name: "clip.mp4".into(),
                kind: EntryKind::File,
                size: 1234,
                mime: Some((MimeClass::Video, "mp4")),
            },
        ];
        let didl = render_didl("", "", &entries, "192.168.1.2:2800");
        assert!(didl.contains("&lt;container"));
        assert!(didl.contains("&lt;item"));
        assert!(didl.contains("object.container.storageFolder"));
        assert!(didl.contains("object.item.videoItem"));
        assert!(didl.contains(r#"size="1234""#));
        assert!(didl.contains("/MediaItems/clip.mp4"));

        // After a client's single SOAP-unescape, this must parse as real
        // XML with container/item elements, not escaped text.
        let unescaped = xml_unescape(&didl);
        assert!(unescaped.contains("<container id=\"Music\""));
        assert!(unescaped.contains("<item id=\"clip.mp4\""));
    }

    #[test]
    fn title_survives_single_unescape_as_escaped_value() {
        let name = "Rock & Roll <Live>";
        let entries = vec![Entry { name: name.into(), kind: EntryKind::Directory, size: 0, mime: None }];
        let didl = render_didl("", "", &entries, "h");
        let unescaped = xml_unescape(&didl);
        // one unescape recovers a valid DIDL document whose title value
        // is itself still (singly) escaped, safe to embed as XML text.
        assert!(unescaped.contains("<dc:title>Rock &amp; Roll &lt;Live&gt;</dc:title>"));
    }
}
