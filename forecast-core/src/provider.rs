use crate::{
    Config, Coordinate, ForecastSeries,
    provider::{metno::MetNoProvider, openweather::OpenWeatherProvider},
};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, header::RETRY_AFTER};
use serde::de::DeserializeOwned;
use std::{convert::TryFrom, fmt::Debug, time::Duration};

pub mod metno;
pub mod openweather;

/// The two upstream forecast models being compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderId {
    /// Model-A: MET Norway Locationforecast.
    MetNo,
    /// Model-B: OpenWeather 5 day / 3 hour forecast.
    OpenWeather,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::MetNo => "metno",
            ProviderId::OpenWeather => "openweather",
        }
    }

    /// Position-neutral label used on the chart and in warnings.
    pub fn model_label(&self) -> &'static str {
        match self {
            ProviderId::MetNo => "Model-A",
            ProviderId::OpenWeather => "Model-B",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::MetNo => "MET Norway",
            ProviderId::OpenWeather => "OpenWeather",
        }
    }

    pub const fn all() -> &'static [ProviderId] {
        &[ProviderId::MetNo, ProviderId::OpenWeather]
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.model_label(), self.display_name())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "metno" | "yr" | "model-a" => Ok(ProviderId::MetNo),
            "openweather" | "model-b" => Ok(ProviderId::OpenWeather),
            _ => Err(anyhow::anyhow!(
                "Unknown provider '{value}'. Supported providers: metno, openweather."
            )),
        }
    }
}

/// Why a single provider fetch produced no series.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("{provider}: network failure: {detail}")]
    NetworkFailure { provider: ProviderId, detail: String },

    #[error("{provider}: rate limited{}", retry_hint(.retry_after_secs))]
    RateLimited { provider: ProviderId, retry_after_secs: Option<u64> },

    #[error("{provider}: response format changed: {detail}")]
    SchemaMismatch { provider: ProviderId, detail: String },

    #[error("{provider}: credentials are not configured")]
    NotConfigured { provider: ProviderId },
}

fn retry_hint(secs: &Option<u64>) -> String {
    secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default()
}

impl ProviderError {
    /// Transient failures are worth another attempt on the next scheduled tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::NetworkFailure { .. } | ProviderError::RateLimited { .. })
    }

    /// Short reason fit for a chat caption.
    pub fn short_reason(&self) -> &'static str {
        match self {
            ProviderError::InvalidCoordinate(_) => "invalid coordinates",
            ProviderError::NetworkFailure { .. } => "service unreachable",
            ProviderError::RateLimited { .. } => "rate limited",
            ProviderError::SchemaMismatch { .. } => "unexpected response format",
            ProviderError::NotConfigured { .. } => "not configured",
        }
    }
}

/// A forecast source. Implementations issue exactly one request per call and
/// keep no state between calls.
#[async_trait]
pub trait ForecastProvider: Send + Sync + Debug {
    fn id(&self) -> ProviderId;

    /// Upper bound on how long one `fetch` may take.
    fn timeout(&self) -> Duration;

    async fn fetch(&self, coordinate: &Coordinate) -> Result<ForecastSeries, ProviderError>;
}

/// Construct a provider from config and explicit ProviderId.
pub fn provider_from_config(
    id: ProviderId,
    config: &Config,
) -> anyhow::Result<Box<dyn ForecastProvider>> {
    let settings = config.provider_config(id).cloned().unwrap_or_default();
    let timeout = settings.timeout_secs.map(Duration::from_secs);

    let boxed: Box<dyn ForecastProvider> = match id {
        ProviderId::MetNo => {
            let user_agent = settings.user_agent.ok_or_else(|| {
                anyhow::anyhow!(
                    "No User-Agent configured for provider '{}'.\n\
                     Hint: run `forecast configure metno` and enter an identifying \
                     User-Agent with contact details.",
                    id.as_str()
                )
            })?;
            let mut provider = MetNoProvider::new(user_agent);
            if let Some(url) = settings.base_url {
                provider = provider.with_base_url(url);
            }
            if let Some(timeout) = timeout {
                provider = provider.with_timeout(timeout);
            }
            Box::new(provider)
        }
        ProviderId::OpenWeather => {
            let api_key = settings.api_key.ok_or_else(|| {
                anyhow::anyhow!(
                    "No API key configured for provider '{}'.\n\
                     Hint: run `forecast configure openweather` and enter your API key.",
                    id.as_str()
                )
            })?;
            let mut provider = OpenWeatherProvider::new(api_key);
            if let Some(url) = settings.base_url {
                provider = provider.with_base_url(url);
            }
            if let Some(timeout) = timeout {
                provider = provider.with_timeout(timeout);
            }
            Box::new(provider)
        }
    };

    Ok(boxed)
}

/// Like [`provider_from_config`], but a provider without credentials becomes
/// an [`UnconfiguredProvider`] so the other model can still be charted.
pub fn provider_or_unconfigured(
    id: ProviderId,
    config: &Config,
) -> anyhow::Result<Box<dyn ForecastProvider>> {
    if config.is_provider_configured(id) {
        return provider_from_config(id, config);
    }
    tracing::warn!(provider = %id, "no credentials configured; it will be reported as unavailable");
    Ok(Box::new(UnconfiguredProvider::new(id)))
}

/// Stand-in for a provider that has no credentials. Every fetch fails with
/// [`ProviderError::NotConfigured`] without touching the network.
#[derive(Debug, Clone, Copy)]
pub struct UnconfiguredProvider {
    id: ProviderId,
}

impl UnconfiguredProvider {
    pub fn new(id: ProviderId) -> Self {
        Self { id }
    }
}

#[async_trait]
impl ForecastProvider for UnconfiguredProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn timeout(&self) -> Duration {
        Duration::ZERO
    }

    async fn fetch(&self, _coordinate: &Coordinate) -> Result<ForecastSeries, ProviderError> {
        Err(ProviderError::NotConfigured { provider: self.id })
    }
}

/// Send `request`, classify the HTTP outcome and deserialize the body.
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    provider: ProviderId,
    request: RequestBuilder,
    timeout: Duration,
) -> Result<T, ProviderError> {
    let res = request.timeout(timeout).send().await.map_err(|e| {
        let detail = if e.is_timeout() {
            format!("no response within {}s", timeout.as_secs_f32())
        } else {
            format!("request failed: {e}")
        };
        ProviderError::NetworkFailure { provider, detail }
    })?;

    let status = res.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = res
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        return Err(ProviderError::RateLimited { provider, retry_after_secs });
    }

    let body = res.text().await.map_err(|e| ProviderError::NetworkFailure {
        provider,
        detail: format!("failed to read response body: {e}"),
    })?;

    if !status.is_success() {
        return Err(ProviderError::NetworkFailure {
            provider,
            detail: format!("HTTP {status}: {}", truncate_body(&body)),
        });
    }

    tracing::debug!(%provider, bytes = body.len(), "provider responded");

    serde_json::from_str(&body).map_err(|e| ProviderError::SchemaMismatch {
        provider,
        detail: e.to_string(),
    })
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
