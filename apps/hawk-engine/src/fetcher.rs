//! Conditional tile retrieval and cache maintenance.
//!
//! One GET per cycle. Stored validators (`ETag`, `last_update`) are
//! reflected as `If-None-Match` / `If-Modified-Since`; a 304 costs
//! nothing beyond the check timestamp. A 200 body is validated against
//! the palette and cached as its canonical paletted re-encode via temp
//! file + rename.

use crate::config::Nest;
use crate::http_client;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use hawk_core::{PalettedImage, PALETTE};
use hawk_kernel::TileRecord;
use tracing::{debug, warn};

/// Result of checking one tile against upstream.
#[derive(Debug)]
pub enum FetchOutcome {
    /// 304, or 200 with an identical representation upstream chose to
    /// resend; nothing to diff.
    Unchanged,
    /// Fresh body validated and cached.
    Changed(PalettedImage),
    /// Body was not a palette-conformant PNG; tile skipped this cycle.
    Rejected,
    /// Timeout, connection failure, or non-2xx status.
    TransportError,
}

pub struct TileFetcher {
    client: reqwest::Client,
    base: String,
}

impl TileFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client::build_client().context("build http client")?,
            base: http_client::tile_base_from_env(),
        })
    }

    pub fn with_base(base: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: http_client::build_client().context("build http client")?,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn tile_url(&self, rec: &TileRecord) -> String {
        format!("{}/{}/{}.png", self.base, rec.x, rec.y)
    }

    /// Check one tile. `rec.last_checked` is set to `now` in memory;
    /// the caller decides which fields to persist per outcome.
    pub async fn check(&self, nest: &Nest, rec: &mut TileRecord, now: i64) -> FetchOutcome {
        let tile = rec.tile();
        let url = self.tile_url(rec);
        let mut request = self.client.get(&url);
        if rec.last_update > 0 {
            request = request.header(
                reqwest::header::IF_MODIFIED_SINCE,
                format_http_date(rec.last_update),
            );
        }
        if !rec.etag.is_empty() {
            request = request.header(reqwest::header::IF_NONE_MATCH, rec.etag.clone());
        }

        rec.last_checked = now;
        let response = match send_with_reset_retry(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!("tile {tile}: request failed: {err}");
                return FetchOutcome::TransportError;
            }
        };

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return FetchOutcome::Unchanged;
        }
        if !response.status().is_success() {
            warn!("tile {tile}: HTTP {}", response.status());
            return FetchOutcome::TransportError;
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let last_update = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date)
            .unwrap_or(now);

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                warn!("tile {tile}: body read failed: {err}");
                return FetchOutcome::TransportError;
            }
        };

        let decoded = tokio::task::spawn_blocking(move || {
            let img = PALETTE.decode(&body)?;
            let bytes = PALETTE.encode(&img)?;
            Ok::<_, hawk_core::PaletteError>((img, bytes))
        })
        .await;
        let (img, canonical) = match decoded {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                warn!("tile {tile}: image rejected: {err}");
                return FetchOutcome::Rejected;
            }
            Err(err) => {
                warn!("tile {tile}: decode task failed: {err}");
                return FetchOutcome::Rejected;
            }
        };

        if let Err(err) = write_cache(nest, rec, &canonical).await {
            warn!("tile {tile}: cache write failed: {err:#}");
            return FetchOutcome::TransportError;
        }
        debug!("tile {tile}: change detected, cache updated");
        rec.etag = etag;
        rec.last_update = last_update;
        FetchOutcome::Changed(img)
    }
}

async fn write_cache(nest: &Nest, rec: &TileRecord, bytes: &[u8]) -> Result<()> {
    let path = nest.tile_path(rec.tile());
    let tmp = path.with_extension("png.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

/// One retry, and only when the peer reset the connection mid-flight.
async fn send_with_reset_retry(
    request: reqwest::RequestBuilder,
) -> reqwest::Result<reqwest::Response> {
    let retry = request.try_clone();
    match request.send().await {
        Ok(response) => Ok(response),
        Err(err) if is_connection_reset(&err) => match retry {
            Some(request) => {
                debug!("connection reset, retrying once");
                request.send().await
            }
            None => Err(err),
        },
        Err(err) => Err(err),
    }
}

fn is_connection_reset(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionReset {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(epoch: i64) -> String {
    Utc.timestamp_opt(epoch, 0)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).expect("epoch zero"))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_date_round_trip() {
        let epoch = 1_700_000_000;
        let formatted = format_http_date(epoch);
        assert!(formatted.ends_with("GMT"));
        assert_eq!(parse_http_date(&formatted), Some(epoch));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_http_date("not a date"), None);
    }

    #[test]
    fn tile_url_shape() {
        let fetcher = TileFetcher::with_base("http://127.0.0.1:9/t").unwrap();
        let rec = TileRecord::new(hawk_core::Tile::new(42, 17));
        assert_eq!(fetcher.tile_url(&rec), "http://127.0.0.1:9/t/42/17.png");
    }
}
