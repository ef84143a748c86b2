use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::common::Result;
use crate::config::NodeSettings;
use crate::correlator::Correlator;
use crate::protocol::{Track, TrackException, TrackInfo};

/// Search prefixes understood by nodes for non-URL queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    Youtube,
    YoutubeMusic,
    SoundCloud,
}

impl SearchType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Youtube => "ytsearch",
            Self::YoutubeMusic => "ytmsearch",
            Self::SoundCloud => "scsearch",
        }
    }
}

/// Result of a track resolution request.
#[derive(Debug, Deserialize)]
#[serde(tag = "loadType")]
pub enum LoadResult {
    #[serde(rename = "TRACK_LOADED")]
    TrackLoaded { tracks: Vec<Track> },
    #[serde(rename = "PLAYLIST_LOADED")]
    PlaylistLoaded {
        tracks: Vec<Track>,
        #[serde(rename = "playlistInfo")]
        playlist_info: PlaylistInfo,
    },
    #[serde(rename = "SEARCH_RESULT")]
    SearchResult { tracks: Vec<Track> },
    #[serde(rename = "NO_MATCHES")]
    NoMatches {},
    #[serde(rename = "LOAD_FAILED")]
    LoadFailed { exception: TrackException },
}

#[derive(Debug, Deserialize)]
pub struct PlaylistInfo {
    pub name: String,
    #[serde(rename = "selectedTrack")]
    pub selected_track: Option<i32>,
}

/// The synchronous-style request channel to one node. Every call is tagged
/// with a generated id and matched back through the [`Correlator`], so
/// deadlines and exactly-once resolution are uniform with the rest of the
/// engine.
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    password: String,
    correlator: Arc<Correlator>,
}

impl RestClient {
    pub(crate) fn new(settings: &NodeSettings, correlator: Arc<Correlator>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("lavapool/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base: settings.rest_uri(),
            password: settings.password.clone(),
            correlator,
        })
    }

    /// Resolves tracks for an identifier: a direct URL, or a plain query
    /// prefixed with the given search type.
    pub async fn fetch_tracks(
        &self,
        query: &str,
        search_type: SearchType,
    ) -> Result<LoadResult> {
        let identifier = if query.starts_with("http://") || query.starts_with("https://") {
            query.to_string()
        } else {
            format!("{}:{}", search_type.prefix(), query)
        };

        let value = self
            .get(&format!(
                "/loadtracks?identifier={}",
                urlencoding::encode(&identifier)
            ))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Decodes a track blob server-side. Prefer [`Track::decode`] when the
    /// blob is a plain Lavaplayer blob; this exists for plugin-encoded ones.
    pub async fn decode_track(&self, encoded: &str) -> Result<TrackInfo> {
        let value = self
            .get(&format!(
                "/decodetrack?track={}",
                urlencoding::encode(encoded)
            ))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// The node's reported version string.
    pub async fn node_version(&self) -> Result<String> {
        let value = self.get_text("/version").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// The node's info payload (build, plugins, capabilities). Kept loose
    /// since its shape varies across node versions and plugins.
    pub async fn node_info(&self) -> Result<Value> {
        self.get("/info").await
    }

    /// Issues a GET and routes the response through the correlator.
    async fn get(&self, path: &str) -> Result<Value> {
        let pending = self.correlator.register();
        let id = pending.id();

        let url = format!("{}{}", self.base, path);
        let request = self
            .http
            .get(&url)
            .header("Authorization", self.password.clone());
        let correlator = self.correlator.clone();

        tokio::spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                    Ok(value) => correlator.complete(id, value),
                    Err(e) => correlator.fail(id, format!("invalid response body: {}", e)),
                },
                Ok(resp) => correlator.fail(id, format!("node answered {}", resp.status())),
                Err(e) => correlator.fail(id, e.to_string()),
            }
        });

        pending.wait().await
    }

    /// Like [`get`](Self::get) for endpoints that answer with a bare body
    /// instead of JSON.
    async fn get_text(&self, path: &str) -> Result<Value> {
        let pending = self.correlator.register();
        let id = pending.id();

        let url = format!("{}{}", self.base, path);
        let request = self
            .http
            .get(&url)
            .header("Authorization", self.password.clone());
        let correlator = self.correlator.clone();

        tokio::spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => match resp.text().await {
                    Ok(text) => correlator.complete(id, Value::String(text)),
                    Err(e) => correlator.fail(id, format!("invalid response body: {}", e)),
                },
                Ok(resp) => correlator.fail(id, format!("node answered {}", resp.status())),
                Err(e) => correlator.fail(id, e.to_string()),
            }
        });

        pending.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_search_result_payload() {
        let track = Track::from_info(TrackInfo {
            identifier: "abc123".into(),
            is_seekable: true,
            author: "someone".into(),
            length: 1_000,
            is_stream: false,
            position: 0,
            title: "a song".into(),
            uri: None,
            artwork_url: None,
            isrc: None,
            source_name: "youtube".into(),
        });

        let payload = serde_json::json!({
            "loadType": "SEARCH_RESULT",
            "tracks": [{"track": track.encoded, "info": track.info}],
        });

        match serde_json::from_value::<LoadResult>(payload).unwrap() {
            LoadResult::SearchResult { tracks } => {
                assert_eq!(tracks.len(), 1);
                assert_eq!(tracks[0].info.identifier, "abc123");
                assert_eq!(tracks[0].encoded, track.encoded);
            }
            other => panic!("expected SEARCH_RESULT, got {:?}", other),
        }
    }

    #[test]
    fn decodes_no_matches_payload() {
        let result: LoadResult = serde_json::from_str(r#"{"loadType": "NO_MATCHES"}"#).unwrap();
        assert!(matches!(result, LoadResult::NoMatches {}));
    }

    #[test]
    fn plain_queries_get_a_search_prefix() {
        assert_eq!(SearchType::Youtube.prefix(), "ytsearch");
        assert_eq!(SearchType::SoundCloud.prefix(), "scsearch");
    }

    /// Serves one canned HTTP response on an ephemeral port.
    async fn one_shot_http(body: &'static str, content_type: &'static str) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                content_type,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
        port
    }

    fn local_client(port: u16) -> RestClient {
        let settings = NodeSettings {
            label: "local".into(),
            host: "127.0.0.1".into(),
            port,
            password: "pw".into(),
            secure: false,
            region: None,
            shards: None,
        };
        RestClient::new(&settings, Correlator::new(Duration::from_secs(5))).unwrap()
    }

    #[tokio::test]
    async fn node_version_round_trips_the_plain_body() {
        let port = one_shot_http("3.7.11", "text/plain").await;
        let version = local_client(port).node_version().await.unwrap();
        assert_eq!(version, "3.7.11");
    }

    #[tokio::test]
    async fn node_info_parses_the_json_payload() {
        let port = one_shot_http(r#"{"buildTime": 0, "plugins": []}"#, "application/json").await;
        let info = local_client(port).node_info().await.unwrap();
        assert_eq!(info["plugins"], serde_json::json!([]));
    }
}
