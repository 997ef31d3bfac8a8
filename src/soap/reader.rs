//! Streaming SOAP body scanner (§4.G). Deliberately not an XML parser:
//! it scans to `<letter>` tag starts and tolerates any surrounding
//! wrapping (SOAP envelope, namespace prefixes, inline whitespace),
//! because a strict parser would reject real-world clients.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

const MAX_TAG_NAME: usize = 19;
const MAX_VALUE: usize = 1024;
const MAX_CHUNK_SIZE: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum BodyReadError {
    #[error("chunk too large")]
    ChunkTooLarge,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads a body bounded either by a chunked transfer-encoding or a
/// fixed `Content-Length`, returning the unframed bytes. Chunks larger
/// than 2048 bytes abort the read.
pub async fn read_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    content_length: usize,
    chunked: bool,
) -> Result<Vec<u8>, BodyReadError> {
    if !chunked {
        let mut buf = vec![0u8; content_length];
        reader.read_exact(&mut buf).await?;
        return Ok(buf);
    }

    let mut out = Vec::new();
    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line).await?;
        let size_str = size_line.trim_end().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| BodyReadError::ChunkTooLarge)?;
        if size > MAX_CHUNK_SIZE {
            return Err(BodyReadError::ChunkTooLarge);
        }
        if size == 0 {
            let mut trailer = String::new();
            reader.read_line(&mut trailer).await?;
            break;
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        out.extend_from_slice(&chunk);
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }
    Ok(out)
}

#[derive(Debug, Default, Clone)]
pub struct BrowseFields {
    pub remote_dirpath: Option<String>,
    pub starting_index: i64,
    pub requested_count: i64,
}

impl BrowseFields {
    fn apply(&mut self, name: &str, value: &str) {
        match name {
            "ObjectID" | "ContainerID" => self.remote_dirpath = Some(value.to_string()),
            "StartingIndex" => {
                if let Ok(n) = value.parse::<i64>() {
                    if n > 0 {
                        self.starting_index = n;
                    }
                }
            }
            "RequestedCount" => {
                if let Ok(n) = value.parse::<i64>() {
                    self.requested_count = n;
                }
            }
            _ => {}
        }
    }
}

/// Scans a fully-assembled (already de-chunked) SOAP body for the flat
/// leaf elements the dispatcher cares about.
pub fn scan_body(body: &[u8]) -> BrowseFields {
    let mut fields = BrowseFields { remote_dirpath: None, starting_index: 0, requested_count: -1 };
    let mut i = 0;
    let len = body.len();

    while i < len {
        // advance to the next '<'
        match body[i..].iter().position(|&b| b == b'<') {
            Some(off) => i += off,
            None => break,
        }
        let tag_start = i + 1;

        // tag name: 1-19 ASCII letters ending at whitespace or '>'
        let mut j = tag_start;
        while j < len && j - tag_start < MAX_TAG_NAME && body[j].is_ascii_alphabetic() {
            j += 1;
        }
        if j == tag_start || j >= len || !(body[j] == b'>' || body[j].is_ascii_whitespace()) {
            i = tag_start;
            continue;
        }
        let name = String::from_utf8_lossy(&body[tag_start..j]).into_owned();

        // skip the rest of the opening tag
        let Some(gt_off) = body[j..].iter().position(|&b| b == b'>') else { break };
        let mut k = j + gt_off + 1;

        // skip leading whitespace inside the element
        while k < len && body[k].is_ascii_whitespace() {
            k += 1;
        }

        // read value up to 1024 bytes or next '<'
        let value_start = k;
        let value_end = match body[k..].iter().position(|&b| b == b'<') {
            Some(off) => k + off,
            None => len,
        };
        let capped_end = std::cmp::min(value_end, value_start + MAX_VALUE);
        if value_end - value_start > MAX_VALUE {
            // overflow: resume scanning at the next '<'
            i = value_end;
            continue;
        }
        let raw_value = &body[value_start..capped_end];
        let value = String::from_utf8_lossy(raw_value);
        let value = value.trim_end();

        // require closer: '</name>'
        let mut c = value_end;
        if c >= len || body[c] != b'<' {
            i = c + 1;
            continue;
        }
        c += 1;
        if c >= len || body[c] != b'/' {
            i = c;
            continue;
        }
        c += 1;
        let closer_end = c + name.len();
        if closer_end > len || &body[c..closer_end] != name.as_bytes() {
            i = value_end + 1;
            continue;
        }
        let mut after = closer_end;
        if after >= len || body[after] != b'>' {
            i = value_end + 1;
            continue;
        }
        after += 1;

        fields.apply(&name, value);
        i = after;
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_browse_fields() {
        let body = br#"<s:Envelope><s:Body><u:Browse xmlns:u="x"><ObjectID>0</ObjectID><StartingIndex>0</StartingIndex><RequestedCount>5</RequestedCount></u:Browse></s:Body></s:Envelope>"#;
        let f = scan_body(body);
        assert_eq!(f.remote_dirpath.as_deref(), Some("0"));
        assert_eq!(f.starting_index, 0); // StartingIndex==0 is not stored (only >0)
        assert_eq!(f.requested_count, 5);
    }

    #[test]
    fn starting_index_only_stored_when_positive() {
        let body = br#"<StartingIndex>7</StartingIndex>"#;
        let f = scan_body(body);
        assert_eq!(f.starting_index, 7);
    }

    #[test]
    fn container_id_also_maps_to_dirpath() {
        let body = br#"<ContainerID>Music</ContainerID>"#;
        let f = scan_body(body);
        assert_eq!(f.remote_dirpath.as_deref(), Some("Music"));
    }

    #[test]
    fn negative_requested_count_means_unlimited() {
        let body = br#"<RequestedCount>-1</RequestedCount>"#;
        let f = scan_body(body);
        assert_eq!(f.requested_count, -1);
    }

    #[test]
    fn malformed_closer_recovers_at_next_tag() {
        let body = br#"<ObjectID>bad</notclosing><StartingIndex>3</StartingIndex>"#;
        let f = scan_body(body);
        assert_eq!(f.starting_index, 3);
    }

    #[tokio::test]
    async fn read_body_unframes_chunked_transfer() {
        let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let body = read_body(&mut reader, 0, true).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn read_body_respects_content_length() {
        let raw = b"hello world extra garbage";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let body = read_body(&mut reader, 11, false).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn read_body_rejects_oversized_chunk() {
        let raw = format!("{:x}\r\n", MAX_CHUNK_SIZE + 1);
        let mut reader = tokio::io::BufReader::new(raw.as_bytes());
        let err = read_body(&mut reader, 0, true).await.unwrap_err();
        assert!(matches!(err, BodyReadError::ChunkTooLarge));
    }

    #[test]
    fn namespace_prefixed_tag_is_skipped_not_matched() {
        // "u:Browse" - scanning stops the name at ':' (not a letter),
        // leaving "u" as a bogus name whose closer won't match, so it's
        // silently skipped and inner leaves are still captured.
        let body = br#"<u:Browse><ObjectID>5</ObjectID></u:Browse>"#;
        let f = scan_body(body);
        assert_eq!(f.remote_dirpath.as_deref(), Some("5"));
    }
}
