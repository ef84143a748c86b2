use std::io::{Cursor, Read, Write};

use base64::prelude::*;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

/// Flag bit marking a versioned track blob header.
const TRACK_INFO_VERSIONED: u32 = 1;

/// Metadata decoded from an encoded track blob. Everywhere else in the
/// engine tracks travel as the opaque base64 string; this is only for
/// callers that want to inspect what a node handed them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds.
    pub length: u64,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
}

/// An encoded track blob paired with its decoded metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Older nodes call this field `track` in REST payloads.
    #[serde(alias = "track")]
    pub encoded: String,
    pub info: TrackInfo,
}

impl Track {
    /// Decodes a Lavaplayer-format base64 blob.
    ///
    /// Layout (big-endian):
    ///   [u32 header: payload size | flags << 30]
    ///   [u8  version, if the versioned flag is set; 1 otherwise]
    ///   [utf title] [utf author] [u64 length] [utf identifier]
    ///   [u8 is_stream] [opt_utf uri (v2+)] [opt_utf artwork (v3+)]
    ///   [opt_utf isrc (v3+)] [utf source_name] [u64 position]
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| Error::TrackDecode(e.to_string()))?;
        let mut cur = Cursor::new(raw.as_slice());

        let header = read_u32(&mut cur)?;
        let flags = (header & 0xC000_0000) >> 30;
        let version = if flags & TRACK_INFO_VERSIONED != 0 {
            read_u8(&mut cur)?
        } else {
            1
        };

        let title = read_utf(&mut cur)?;
        let author = read_utf(&mut cur)?;
        let length = read_u64(&mut cur)?;
        let identifier = read_utf(&mut cur)?;
        let is_stream = read_u8(&mut cur)? != 0;

        let uri = if version >= 2 {
            read_opt_utf(&mut cur)?
        } else {
            None
        };
        let (artwork_url, isrc) = if version >= 3 {
            (read_opt_utf(&mut cur)?, read_opt_utf(&mut cur)?)
        } else {
            (None, None)
        };

        let source_name = read_utf(&mut cur)?;
        let position = read_u64(&mut cur)?;

        Ok(Self {
            encoded: encoded.to_string(),
            info: TrackInfo {
                identifier,
                is_seekable: !is_stream,
                author,
                length,
                is_stream,
                position,
                title,
                uri,
                artwork_url,
                isrc,
                source_name,
            },
        })
    }

    /// Builds an encoded version-3 blob from metadata.
    pub fn from_info(info: TrackInfo) -> Self {
        let mut body = Vec::new();
        // Infallible: Vec<u8> writes cannot fail.
        body.write_u8(3).unwrap();
        write_utf(&mut body, &info.title);
        write_utf(&mut body, &info.author);
        body.write_u64::<BigEndian>(info.length).unwrap();
        write_utf(&mut body, &info.identifier);
        body.write_u8(info.is_stream as u8).unwrap();
        write_opt_utf(&mut body, info.uri.as_deref());
        write_opt_utf(&mut body, info.artwork_url.as_deref());
        write_opt_utf(&mut body, info.isrc.as_deref());
        write_utf(&mut body, &info.source_name);
        body.write_u64::<BigEndian>(info.position).unwrap();

        let mut framed = Vec::with_capacity(body.len() + 4);
        framed
            .write_u32::<BigEndian>(body.len() as u32 | (TRACK_INFO_VERSIONED << 30))
            .unwrap();
        framed.extend_from_slice(&body);

        Self {
            encoded: BASE64_STANDARD.encode(&framed),
            info,
        }
    }
}

fn read_u8(cur: &mut Cursor<&[u8]>) -> Result<u8> {
    cur.read_u8().map_err(truncated)
}

fn read_u32(cur: &mut Cursor<&[u8]>) -> Result<u32> {
    cur.read_u32::<BigEndian>().map_err(truncated)
}

fn read_u64(cur: &mut Cursor<&[u8]>) -> Result<u64> {
    cur.read_u64::<BigEndian>().map_err(truncated)
}

fn read_utf(cur: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cur.read_u16::<BigEndian>().map_err(truncated)? as usize;
    let mut buf = vec![0u8; len];
    cur.read_exact(&mut buf).map_err(truncated)?;
    String::from_utf8(buf).map_err(|e| Error::TrackDecode(e.to_string()))
}

fn read_opt_utf(cur: &mut Cursor<&[u8]>) -> Result<Option<String>> {
    if read_u8(cur)? != 0 {
        read_utf(cur).map(Some)
    } else {
        Ok(None)
    }
}

fn truncated(e: std::io::Error) -> Error {
    Error::TrackDecode(format!("truncated blob: {}", e))
}

fn write_utf(buf: &mut Vec<u8>, s: &str) {
    buf.write_u16::<BigEndian>(s.len() as u16).unwrap();
    buf.write_all(s.as_bytes()).unwrap();
}

fn write_opt_utf(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(v) => {
            buf.write_u8(1).unwrap();
            write_utf(buf, v);
        }
        None => buf.write_u8(0).unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> TrackInfo {
        TrackInfo {
            identifier: "dQw4w9WgXcQ".to_string(),
            is_seekable: true,
            author: "Rick Astley".to_string(),
            length: 212_000,
            is_stream: false,
            position: 0,
            title: "Never Gonna Give You Up".to_string(),
            uri: Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string()),
            artwork_url: None,
            isrc: Some("GBARL9300135".to_string()),
            source_name: "youtube".to_string(),
        }
    }

    #[test]
    fn decodes_what_it_encodes() {
        let track = Track::from_info(sample_info());
        let decoded = Track::decode(&track.encoded).expect("decode should succeed");

        assert_eq!(decoded.info, sample_info());
        assert_eq!(decoded.encoded, track.encoded);
    }

    #[test]
    fn rejects_invalid_base64() {
        let err = Track::decode("not base64!!").unwrap_err();
        assert!(matches!(err, Error::TrackDecode(_)));
    }

    #[test]
    fn rejects_truncated_blob() {
        let track = Track::from_info(sample_info());
        let raw = BASE64_STANDARD.decode(&track.encoded).unwrap();
        let cut = BASE64_STANDARD.encode(&raw[..raw.len() / 2]);

        let err = Track::decode(&cut).unwrap_err();
        assert!(matches!(err, Error::TrackDecode(_)));
    }
}
