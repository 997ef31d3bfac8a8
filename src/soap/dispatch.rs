//! SOAP action dispatch (§4.H): decides what a `SOAPAction` header means
//! and builds the matching envelope.

use std::path::Path;

use crate::dirlist::{self, ListError};
use crate::soap::didl::render_didl;
use crate::soap::reader::BrowseFields;

pub enum SoapOutcome {
    Ok { status_line: &'static str, body: String },
    /// The action name itself isn't implemented (e.g. `Search`); HTTP
    /// 708 "Unsupported Action" with a matching `UPnPError` fault.
    UnsupportedAction,
    /// The action is known but its arguments don't resolve to anything
    /// valid; HTTP 401 "Invalid Action" with a matching `UPnPError` fault.
    InvalidAction,
}

fn soap_fault(code: u16, description: &str) -> String {
    envelope(&format!(
        r#"<s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring><detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0"><errorCode>{code}</errorCode><errorDescription>{description}</errorDescription></UPnPError></detail></s:Fault>"#
    ))
}

/// Renders the HTTP status + SOAP Fault body for a `SoapOutcome` error
/// variant; `None` for `Ok`, which carries its own body already.
pub fn outcome_fault(outcome: &SoapOutcome) -> Option<(u16, String)> {
    match outcome {
        SoapOutcome::Ok { .. } => None,
        SoapOutcome::UnsupportedAction => Some((708, soap_fault(708, "Unsupported Action"))),
        SoapOutcome::InvalidAction => Some((401, soap_fault(401, "Invalid Action"))),
    }
}

fn envelope(body_inner: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body>{body_inner}</s:Body></s:Envelope>"#
    )
}

fn browse_response(result_didl: &str, number_returned: usize, total_matches: usize) -> String {
    envelope(&format!(
        r#"<u:BrowseResponse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1"><Result>{result_didl}</Result><NumberReturned>{nr}</NumberReturned><TotalMatches>{tm}</TotalMatches><UpdateID>0</UpdateID></u:BrowseResponse>"#,
        nr = number_returned,
        tm = total_matches,
    ))
}

/// Extracts the action name from a `SOAPAction` header value, which is
/// quoted and usually namespaced with `#` (`"urn:...:ContentDirectory:1#Browse"`).
pub fn action_name(header_value: &str) -> String {
    let trimmed = header_value.trim().trim_matches('"');
    match trimmed.rsplit_once('#') {
        Some((_, action)) => action.to_string(),
        None => trimmed.to_string(),
    }
}

/// Normalises the request's `ObjectID`: the well-known root id `"0"`
/// becomes the empty path/parent id used throughout.
fn normalise_object_id(raw: &str) -> String {
    if raw == "0" {
        String::new()
    } else {
        raw.to_string()
    }
}

pub async fn dispatch(
    action: &str,
    fields: &BrowseFields,
    media_root: &Path,
    host: &str,
) -> SoapOutcome {
    match action {
        "Browse" => {
            let requested = fields.remote_dirpath.clone().unwrap_or_default();
            let dir_path = normalise_object_id(&requested);
            let resolved = dirlist::resolve_contained(media_root, &dir_path);
            let resolved = match resolved {
                Ok(p) => p,
                Err(ListError::Containment) => return SoapOutcome::InvalidAction,
                Err(_) => return SoapOutcome::InvalidAction,
            };
            let entries = match dirlist::list_directory(&resolved).await {
                Ok(e) => e,
                Err(_) => return SoapOutcome::InvalidAction,
            };
            let (window, total) = dirlist::paginate(entries, fields.starting_index, fields.requested_count);
            let didl = render_didl(&dir_path, &dir_path, &window, host);
            SoapOutcome::Ok {
                status_line: "HTTP/1.1 200 OK",
                body: browse_response(&didl, window.len(), total),
            }
        }
        "Search" => SoapOutcome::UnsupportedAction,
        "GetSearchCapabilities" => SoapOutcome::Ok {
            status_line: "HTTP/1.1 200 OK",
            body: envelope(
                r#"<u:GetSearchCapabilitiesResponse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1"><SearchCaps>@id, @parentID, @refID </SearchCaps></u:GetSearchCapabilitiesResponse>"#,
            ),
        },
        "GetSortCapabilities" => SoapOutcome::Ok {
            status_line: "HTTP/1.1 200 OK",
            body: envelope(
                r#"<u:GetSortCapabilitiesResponse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1"><SortCaps>dc:title,</SortCaps></u:GetSortCapabilitiesResponse>"#,
            ),
        },
        "GetProtocolInfo" => {
            let source = crate::util::mime::all_protocol_infos().join(",");
            SoapOutcome::Ok {
                status_line: "HTTP/1.1 200 OK",
                body: envelope(&format!(
                    r#"<u:GetProtocolInfoResponse xmlns:u="urn:schemas-upnp-org:service:ConnectionManager:1"><Source>{source}</Source><Sink></Sink></u:GetProtocolInfoResponse>"#
                )),
            }
        }
        _ => SoapOutcome::InvalidAction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn action_name_strips_quotes_and_namespace() {
        assert_eq!(
            action_name("\"urn:schemas-upnp-org:service:ContentDirectory:1#Browse\""),
            "Browse"
        );
    }

    #[tokio::test]
    async fn browse_root_lists_visible_entries_only() {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("Music")).await.unwrap();
        tokio::fs::write(dir.path().join("clip.mp4"), vec![0u8; 10]).await.unwrap();
        tokio::fs::write(dir.path().join("notes.xyz"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join(".hidden"), b"x").await.unwrap();

        let fields = BrowseFields {
            remote_dirpath: Some("0".to_string()),
            starting_index: 0,
            requested_count: 5,
        };
        let outcome = dispatch("Browse", &fields, dir.path(), "192.168.1.2:2800").await;
        match outcome {
            SoapOutcome::Ok { body, .. } => {
                assert!(body.contains("<TotalMatches>2</TotalMatches>"));
                assert!(body.contains("&lt;container"));
                assert!(body.contains("&lt;item"));
                assert!(!body.contains("&amp;lt;container"));
                assert!(!body.contains("notes.xyz"));
                assert!(!body.contains(".hidden"));
            }
            _ => panic!("expected Ok"),
        }
    }

    #[test]
    fn fault_bodies_carry_matching_status_and_error_code() {
        let (status, body) = outcome_fault(&SoapOutcome::UnsupportedAction).unwrap();
        assert_eq!(status, 708);
        assert!(body.contains("<errorCode>708</errorCode>"));

        let (status, body) = outcome_fault(&SoapOutcome::InvalidAction).unwrap();
        assert_eq!(status, 401);
        assert!(body.contains("<errorCode>401</errorCode>"));

        assert!(outcome_fault(&SoapOutcome::Ok { status_line: "HTTP/1.1 200 OK", body: String::new() }).is_none());
    }

    #[tokio::test]
    async fn search_action_is_unsupported() {
        let dir = tempdir().unwrap();
        let fields = BrowseFields::default();
        let outcome = dispatch("Search", &fields, dir.path(), "h").await;
        assert!(matches!(outcome, SoapOutcome::UnsupportedAction));
    }

    #[tokio::test]
    async fn unknown_action_is_invalid() {
        let dir = tempdir().unwrap();
        let fields = BrowseFields::default();
        let outcome = dispatch("FooBar", &fields, dir.path(), "h").await;
        assert!(matches!(outcome, SoapOutcome::InvalidAction));
    }
}
