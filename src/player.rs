//! Player-control API surface.
//!
//! Every call builds a bearer-authorized request against the player
//! sub-resource and interprets the status code:
//!
//! * `currently_playing`: GET; 200 yields a [`PlaybackSnapshot`], 204 means
//!   no active session and is a no-op, not an error
//! * `next` / `previous`: POST; success is 204
//! * `toggle`: PUT to `/pause` or `/play` depending on the current state;
//!   the caller flips its play flag only on a 204, never optimistically
//!
//! Control calls are fire-and-forget: the authoritative state is re-fetched
//! shortly after rather than predicted.

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::{
    config::Config,
    events::EventSink,
    exchange::{HttpExchange, HttpExchanger},
    transport,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] transport::Error),

    #[error("player endpoint returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("parsing playback payload failed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// State of the user's current playback, as of the last successful fetch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub track_id: String,
    pub track_name: String,
    pub artist_names: Vec<String>,
    pub is_playing: bool,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub album_art: Option<Url>,
}

impl PlaybackSnapshot {
    /// Time left in the current track.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.duration_ms.saturating_sub(self.progress_ms))
    }
}

#[derive(Deserialize)]
struct CurrentlyPlaying {
    is_playing: bool,
    #[serde(default)]
    progress_ms: u64,
    item: Option<Item>,
}

#[derive(Deserialize)]
struct Item {
    id: String,
    name: String,
    duration_ms: u64,
    artists: Vec<Artist>,
    album: Album,
}

#[derive(Deserialize)]
struct Artist {
    name: String,
}

#[derive(Deserialize)]
struct Album {
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Deserialize)]
struct Image {
    url: Url,
    #[serde(default)]
    height: Option<u32>,
}

impl Album {
    /// The second-smallest image balances display size against transfer
    /// time on a small screen; a single image is used as-is.
    fn art(mut self) -> Option<Url> {
        self.images.sort_by_key(|image| image.height);
        let fallback = self.images.first();
        self.images
            .get(1)
            .or(fallback)
            .map(|image| image.url.clone())
    }
}

/// Client for the player-control endpoints.
pub struct PlayerClient {
    config: Config,
    exchanger: Arc<dyn HttpExchanger>,
    sink: Arc<dyn EventSink>,
}

impl PlayerClient {
    #[must_use]
    pub fn new(config: Config, exchanger: Arc<dyn HttpExchanger>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            exchanger,
            sink,
        }
    }

    /// Fetches the user's current playback.
    ///
    /// `Ok(None)` means the service reports no active session (204).
    pub async fn currently_playing(
        &self,
        access_token: &str,
    ) -> Result<Option<PlaybackSnapshot>> {
        let response = self
            .request("GET", "/currently-playing", access_token)
            .await?;

        match response.status_code {
            200 => {
                let payload: CurrentlyPlaying = serde_json::from_slice(&response.body)
                    .map_err(|e| {
                        self.sink.error(
                            500,
                            "unable to parse playback payload",
                            Some(&response.body_text()),
                        );
                        e
                    })?;

                let Some(item) = payload.item else {
                    return Ok(None);
                };

                Ok(Some(PlaybackSnapshot {
                    track_id: item.id,
                    track_name: item.name,
                    artist_names: item.artists.into_iter().map(|artist| artist.name).collect(),
                    is_playing: payload.is_playing,
                    progress_ms: payload.progress_ms,
                    duration_ms: item.duration_ms,
                    album_art: item.album.art(),
                }))
            }
            204 => Ok(None),
            _ => Err(self.report(response)),
        }
    }

    /// Skips to the next track.
    pub async fn next(&self, access_token: &str) -> Result<()> {
        self.control("POST", "/next", access_token).await
    }

    /// Skips to the previous track.
    pub async fn previous(&self, access_token: &str) -> Result<()> {
        self.control("POST", "/previous", access_token).await
    }

    /// Pauses when playing, resumes when paused.
    ///
    /// The caller flips its play flag only when this returns `Ok`.
    pub async fn toggle(&self, access_token: &str, currently_playing: bool) -> Result<()> {
        let endpoint = if currently_playing { "/pause" } else { "/play" };
        self.control("PUT", endpoint, access_token).await
    }

    async fn control(&self, method: &str, endpoint: &str, access_token: &str) -> Result<()> {
        let response = self.request(method, endpoint, access_token).await?;
        if response.status_code == 204 {
            Ok(())
        } else {
            Err(self.report(response))
        }
    }

    async fn request(
        &self,
        method: &str,
        endpoint: &str,
        access_token: &str,
    ) -> Result<HttpExchange> {
        let head = format!(
            "{method} /v1/me/player{endpoint} HTTP/1.1\r\n\
             Host: {}\r\n\
             Authorization: Bearer {access_token}\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\r\n",
            self.config.api_host,
        );

        Ok(self
            .exchanger
            .exchange(&self.config.api_host, self.config.api_port, &head, b"")
            .await?)
    }

    fn report(&self, response: HttpExchange) -> Error {
        let body = response.body_text();
        self.sink
            .error(response.status_code, "spotify error", Some(&body));
        Error::Api {
            status: response.status_code,
            body,
        }
    }
}
