//! Extension to MIME (major class, subtype) lookup.
//!
//! The table below is the same sorted extension→type table carried by
//! the reference implementation; it must stay sorted by extension for
//! the binary search to work.

/// Coarse media class a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeClass {
    Video,
    Audio,
    Image,
    Text,
}

impl MimeClass {
    pub fn as_str(self) -> &'static str {
        match self {
            MimeClass::Video => "video",
            MimeClass::Audio => "audio",
            MimeClass::Image => "image",
            MimeClass::Text => "text",
        }
    }
}

type Entry = (&'static str, MimeClass, &'static str);

use MimeClass::{Audio, Image, Text, Video};

static TYPES: &[Entry] = &[
    ("3ds", Image, "x-3ds"),
    ("3g2", Video, "3gpp2"),
    ("3gp", Video, "3gpp"),
    ("aac", Audio, "x-aac"),
    ("adp", Audio, "adpcm"),
    ("aif", Audio, "x-aiff"),
    ("aifc", Audio, "x-aiff"),
    ("aiff", Audio, "x-aiff"),
    ("asf", Video, "x-ms-asf"),
    ("asx", Video, "x-ms-asf"),
    ("au", Audio, "basic"),
    ("avi", Video, "x-msvideo"),
    ("bmp", Image, "bmp"),
    ("btif", Image, "prs.btif"),
    ("caf", Audio, "x-caf"),
    ("cgm", Image, "cgm"),
    ("cmx", Image, "x-cmx"),
    ("dif", Video, "x-dv"),
    ("djv", Image, "vnd.djvu"),
    ("djvu", Image, "vnd.djvu"),
    ("dra", Audio, "vnd.dra"),
    ("dsd", Audio, "x-dsd"),
    ("dts", Audio, "vnd.dts"),
    ("dtshd", Audio, "vnd.dts.hd"),
    ("dv", Video, "x-dv"),
    ("dvb", Video, "vnd.dvb.file"),
    ("dwg", Image, "vnd.dwg"),
    ("dxf", Image, "vnd.dxf"),
    ("eol", Audio, "vnd.digital-winds"),
    ("f4v", Video, "x-f4v"),
    ("fbs", Image, "vnd.fastbidsheet"),
    ("fh", Image, "x-freehand"),
    ("fh4", Image, "x-freehand"),
    ("fh5", Image, "x-freehand"),
    ("fh7", Image, "x-freehand"),
    ("fhc", Image, "x-freehand"),
    ("flac", Audio, "x-flac"),
    ("fli", Video, "x-fli"),
    ("flv", Video, "x-flv"),
    ("fpx", Image, "vnd.fpx"),
    ("fst", Image, "vnd.fst"),
    ("fvt", Video, "vnd.fvt"),
    ("g3", Image, "g3fax"),
    ("gif", Image, "gif"),
    ("h261", Video, "h261"),
    ("h263", Video, "h263"),
    ("h264", Video, "h264"),
    ("ico", Image, "x-icon"),
    ("ief", Image, "ief"),
    ("jp2", Image, "jp2"),
    ("jpe", Image, "jpeg"),
    ("jpeg", Image, "jpeg"),
    ("jpg", Image, "jpeg"),
    ("jpgm", Video, "jpm"),
    ("jpgv", Video, "jpeg"),
    ("jpm", Video, "jpm"),
    ("kar", Audio, "midi"),
    ("ktx", Image, "ktx"),
    ("lvp", Audio, "vnd.lucent.voice"),
    ("m1v", Video, "mpeg"),
    ("m2a", Audio, "mpeg"),
    ("m2v", Video, "mpeg"),
    ("m3a", Audio, "mpeg"),
    ("m3u", Audio, "x-mpegurl"),
    ("m4a", Audio, "mp4a-latm"),
    ("m4p", Audio, "mp4a-latm"),
    ("m4u", Video, "vnd.mpegurl"),
    ("m4v", Video, "x-m4v"),
    ("mac", Image, "x-macpaint"),
    ("mdi", Image, "vnd.ms-modi"),
    ("mid", Audio, "midi"),
    ("midi", Audio, "midi"),
    ("mj2", Video, "mj2"),
    ("mjp2", Video, "mj2"),
    ("mk3d", Video, "x-matroska"),
    ("mka", Audio, "x-matroska"),
    ("mks", Video, "x-matroska"),
    ("mkv", Video, "x-matroska"),
    ("mmr", Image, "vnd.fujixerox.edmics-mmr"),
    ("mng", Video, "x-mng"),
    ("mov", Video, "quicktime"),
    ("movie", Video, "x-sgi-movie"),
    ("mp2", Audio, "mpeg"),
    ("mp2a", Audio, "mpeg"),
    ("mp3", Audio, "mpeg"),
    ("mp4", Video, "mp4"),
    ("mp4a", Audio, "mp4"),
    ("mp4v", Video, "mp4"),
    ("mpe", Video, "mpeg"),
    ("mpeg", Video, "mpeg"),
    ("mpg", Video, "mpeg"),
    ("mpg4", Video, "mp4"),
    ("mpga", Audio, "mpeg"),
    ("mxu", Video, "vnd.mpegurl"),
    ("npx", Image, "vnd.net-fpx"),
    ("oga", Audio, "ogg"),
    ("ogg", Audio, "ogg"),
    ("ogv", Video, "ogg"),
    ("pbm", Image, "x-portable-bitmap"),
    ("pcm", Audio, "L16"),
    ("pct", Image, "x-pict"),
    ("pcx", Image, "x-pcx"),
    ("pgm", Image, "x-portable-graymap"),
    ("pic", Image, "x-pict"),
    ("pict", Image, "pict"),
    ("png", Image, "png"),
    ("pnm", Image, "x-portable-anymap"),
    ("pnt", Image, "x-macpaint"),
    ("pntg", Image, "x-macpaint"),
    ("ppm", Image, "x-portable-pixmap"),
    ("psd", Image, "vnd.adobe.photoshop"),
    ("pya", Audio, "vnd.ms-playready.media.pya"),
    ("pyv", Video, "vnd.ms-playready.media.pyv"),
    ("qt", Video, "quicktime"),
    ("qti", Image, "x-quicktime"),
    ("qtif", Image, "x-quicktime"),
    ("ra", Audio, "x-pn-realaudio"),
    ("ram", Audio, "x-pn-realaudio"),
    ("ras", Image, "x-cmu-raster"),
    ("rgb", Image, "x-rgb"),
    ("rip", Audio, "vnd.rip"),
    ("rlc", Image, "vnd.fujixerox.edmics-rlc"),
    ("rmi", Audio, "midi"),
    ("rmp", Audio, "x-pn-realaudio-plugin"),
    ("s3m", Audio, "s3m"),
    ("sgi", Image, "sgi"),
    ("sid", Image, "x-mrsid-image"),
    ("sil", Audio, "silk"),
    ("smv", Video, "x-smv"),
    ("snd", Audio, "basic"),
    ("spx", Audio, "ogg"),
    ("srt", Text, "srt"),
    ("sub", Image, "vnd.dvb.subtitle"),
    ("svg", Image, "svg+xml"),
    ("svgz", Image, "svg+xml"),
    ("tga", Image, "x-tga"),
    ("tif", Image, "tiff"),
    ("tiff", Image, "tiff"),
    ("ts", Video, "mp2t"),
    ("uva", Audio, "vnd.dece.audio"),
    ("uvg", Image, "vnd.dece.graphic"),
    ("uvh", Video, "vnd.dece.hd"),
    ("uvi", Image, "vnd.dece.graphic"),
    ("uvm", Video, "vnd.dece.mobile"),
    ("uvp", Video, "vnd.dece.pd"),
    ("uvs", Video, "vnd.dece.sd"),
    ("uvu", Video, "vnd.uvvu.mp4"),
    ("uvv", Video, "vnd.dece.video"),
    ("uvva", Audio, "vnd.dece.audio"),
    ("uvvg", Image, "vnd.dece.graphic"),
    ("uvvh", Video, "vnd.dece.hd"),
    ("uvvi", Image, "vnd.dece.graphic"),
    ("uvvm", Video, "vnd.dece.mobile"),
    ("uvvp", Video, "vnd.dece.pd"),
    ("uvvs", Video, "vnd.dece.sd"),
    ("uvvu", Video, "vnd.uvvu.mp4"),
    ("uvvv", Video, "vnd.dece.video"),
    ("viv", Video, "vnd.vivo"),
    ("vob", Video, "x-ms-vob"),
    ("wav", Audio, "x-wav"),
    ("wax", Audio, "x-ms-wax"),
    ("wbmp", Image, "vnd.wap.wbmp"),
    ("wdp", Image, "vnd.ms-photo"),
    ("weba", Audio, "webm"),
    ("webm", Video, "webm"),
    ("webp", Image, "webp"),
    ("wm", Video, "x-ms-wm"),
    ("wma", Audio, "x-ms-wma"),
    ("wmv", Video, "x-ms-wmv"),
    ("wmx", Video, "x-ms-wmx"),
    ("wvx", Video, "x-ms-wvx"),
    ("xbm", Image, "x-xbitmap"),
    ("xif", Image, "vnd.xiff"),
    ("xm", Audio, "xm"),
    ("xpm", Image, "x-xpixmap"),
    ("xwd", Image, "x-xwindowdump"),
];

fn lookup_ext(ext: &str) -> Option<&'static Entry> {
    let lower = ext.to_ascii_lowercase();
    TYPES
        .binary_search_by(|(e, _, _)| e.cmp(&lower.as_str()))
        .ok()
        .map(|i| &TYPES[i])
}

/// `http-get:*:<major>/<subtype>:*` for every distinct (class, subtype)
/// pair in the table, used to build `GetProtocolInfo`'s `<Source>`.
pub fn all_protocol_infos() -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for (_, class, sub) in TYPES {
        let key = (class.as_str(), *sub);
        if seen.insert(key) {
            out.push(format!("http-get:*:{}/{}:*", class.as_str(), sub));
        }
    }
    out
}

/// Looks at the extension after the last `.` within the last 6
/// characters of `filename`; returns `None` for unrecognised or missing
/// extensions.
pub fn mime_lookup(filename: &str) -> Option<(MimeClass, &'static str)> {
    let bytes = filename.as_bytes();
    let len = bytes.len();
    let floor = len.saturating_sub(6);
    for i in (floor..len).rev() {
        if bytes[i] == b'.' {
            let ext = &filename[i + 1..];
            return lookup_ext(ext).map(|(_, class, sub)| (*class, *sub));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted() {
        for pair in TYPES.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{} >= {}", pair[0].0, pair[1].0);
        }
    }

    #[test]
    fn known_extension() {
        let (class, sub) = mime_lookup("clip.mp4").unwrap();
        assert_eq!(class, MimeClass::Video);
        assert_eq!(sub, "mp4");
    }

    #[test]
    fn case_insensitive() {
        let (class, _) = mime_lookup("CLIP.MP4").unwrap();
        assert_eq!(class, MimeClass::Video);
    }

    #[test]
    fn unknown_extension_is_none() {
        assert!(mime_lookup("notes.xyz").is_none());
    }

    #[test]
    fn extension_too_far_from_end_is_ignored() {
        // ".mp4" here is further back than 6 chars from the end.
        assert!(mime_lookup("clip.mp4.superlongsuffix").is_none());
    }

    #[test]
    fn no_extension_is_none() {
        assert!(mime_lookup("README").is_none());
    }
}
