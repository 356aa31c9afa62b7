//! Endpoint derivation from the configured base URLs

use capsule_core::{ApiConfig, Error, Result};
use url::Url;

#[derive(Debug, Clone)]
pub struct Endpoints {
    http_base: Url,
    ws_base: Option<Url>,
    token: Option<String>,
}

impl Endpoints {
    pub fn from_config(api: &ApiConfig) -> Result<Self> {
        let http_base = parse_base(&api.base_url)?;
        let ws_base = match &api.ws_base_url {
            Some(raw) => Some(parse_base(raw)?),
            None => derive_ws_base(&http_base),
        };

        Ok(Self {
            http_base,
            ws_base,
            token: api.token.clone(),
        })
    }

    pub fn http_base(&self) -> &Url {
        &self.http_base
    }

    /// WebSocket base, when one is configured or derivable.
    pub fn ws_base(&self) -> Option<&Url> {
        self.ws_base.as_ref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// `/ws/runs/{run_id}`
    pub fn ws_url(&self, run_id: &str) -> Option<Url> {
        self.ws_base
            .as_ref()
            .map(|base| with_segments(base, &["ws", "runs", run_id]))
    }

    /// `/api/v1/capsules/run/{run_id}/stream`
    pub fn sse_url(&self, run_id: &str) -> Url {
        self.api_url(&["capsules", "run", run_id, "stream"])
    }

    /// `/api/v1/capsules/run/{run_id}/cancel`
    pub fn cancel_url(&self, run_id: &str) -> Url {
        self.api_url(&["capsules", "run", run_id, "cancel"])
    }

    /// `/api/v1/{segments...}`
    pub fn api_url(&self, segments: &[&str]) -> Url {
        let mut all = Vec::with_capacity(segments.len() + 2);
        all.extend_from_slice(&["api", "v1"]);
        all.extend_from_slice(segments);
        with_segments(&self.http_base, &all)
    }
}

fn parse_base(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::config_error(format!("Invalid base URL {:?}: {}", raw, e)))?;
    if url.cannot_be_a_base() {
        return Err(Error::config_error(format!(
            "Base URL {:?} cannot carry a path",
            raw
        )));
    }
    Ok(url)
}

/// Map `http`/`https` to `ws`/`wss`. Any other scheme has no usable WebSocket
/// base and leaves the manager on SSE.
fn derive_ws_base(http: &Url) -> Option<Url> {
    let scheme = match http.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return None,
    };
    let mut ws = http.clone();
    ws.set_scheme(scheme).ok()?;
    Some(ws)
}

/// Append percent-encoded path segments to a base URL.
fn with_segments(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}
