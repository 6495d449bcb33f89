//! Run-once orchestration: fetch both providers, align, render.
//!
//! A single failing provider only degrades the result; the run fails outright
//! when there is no coordinate, when both providers fail, when there is
//! nothing to plot, or when the overall deadline passes.

use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    Config,
    model::{ChatId, Comparison, Coordinate, ForecastAxis, ForecastSeries},
    normalize::AlignmentPolicy,
    provider::{ForecastProvider, ProviderError, ProviderId, provider_or_unconfigured},
    render::{RenderError, RenderStyle, render_comparison},
};

/// Where a run currently is. `Failed` is represented by the `Err` side of
/// [`Pipeline::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Idle,
    Fetching,
    Normalizing,
    Rendering,
    Done,
}

/// A non-fatal problem with one provider.
#[derive(Debug, Clone, PartialEq)]
pub enum DegradationWarning {
    Unavailable { provider: ProviderId, error: ProviderError },
    NoUsableData { provider: ProviderId },
}

impl DegradationWarning {
    pub fn provider(&self) -> ProviderId {
        match self {
            DegradationWarning::Unavailable { provider, .. }
            | DegradationWarning::NoUsableData { provider } => *provider,
        }
    }
}

impl fmt::Display for DegradationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradationWarning::Unavailable { provider, error } => {
                write!(f, "{provider} unavailable ({})", error.short_reason())
            }
            DegradationWarning::NoUsableData { provider } => {
                write!(f, "{provider} returned no data for this period")
            }
        }
    }
}

/// Terminal failure of a run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunFailure {
    #[error("location is not configured: {0}")]
    NotConfigured(String),

    #[error("both providers unavailable: {model_a}; {model_b}")]
    BothProvidersUnavailable { model_a: ProviderError, model_b: ProviderError },

    #[error("nothing to render")]
    NothingToRender,

    #[error("rendering failed: {0}")]
    Render(String),

    #[error("run exceeded its {}s deadline", .0.as_secs())]
    Timeout(Duration),

    #[error("a run for this chat is already in progress")]
    AlreadyRunning,

    #[error("settings storage failed: {0}")]
    Storage(String),
}

impl RunFailure {
    /// Plain-text explanation for the chat.
    pub fn user_message(&self) -> String {
        match self {
            RunFailure::NotConfigured(_) => {
                "Coordinates are not set for this chat. An admin can set them with /setcoords <lat> <lon>."
                    .to_string()
            }
            RunFailure::BothProvidersUnavailable { .. } => {
                "Both forecast services are unavailable right now. Please try again later.".to_string()
            }
            RunFailure::NothingToRender => {
                "Neither forecast service returned data for the coming days.".to_string()
            }
            RunFailure::Render(_) | RunFailure::Storage(_) => {
                "Could not prepare the forecast. Please try again later.".to_string()
            }
            RunFailure::Timeout(_) => {
                "The forecast services took too long to answer. Please try again later.".to_string()
            }
            RunFailure::AlreadyRunning => {
                "A forecast is already being prepared for this chat.".to_string()
            }
        }
    }
}

impl From<RenderError> for RunFailure {
    fn from(e: RenderError) -> Self {
        match e {
            RenderError::NothingToRender => RunFailure::NothingToRender,
            other => RunFailure::Render(other.to_string()),
        }
    }
}

/// Successful run output. Not persisted.
#[derive(Debug, Clone)]
pub struct ComparisonResult {
    pub comparison: Comparison,
    pub image: Vec<u8>,
    pub warnings: Vec<DegradationWarning>,
}

/// Fetch/align/render sequence over two providers.
#[derive(Debug, Clone)]
pub struct Pipeline {
    model_a: Arc<dyn ForecastProvider>,
    model_b: Arc<dyn ForecastProvider>,
    policy: AlignmentPolicy,
    style: RenderStyle,
    render_budget: Duration,
}

impl Pipeline {
    pub const DEFAULT_RENDER_BUDGET: Duration = Duration::from_secs(10);

    pub fn new(model_a: Arc<dyn ForecastProvider>, model_b: Arc<dyn ForecastProvider>) -> Self {
        Self {
            model_a,
            model_b,
            policy: AlignmentPolicy::default(),
            style: RenderStyle::default(),
            render_budget: Self::DEFAULT_RENDER_BUDGET,
        }
    }

    pub fn with_policy(mut self, policy: AlignmentPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_style(mut self, style: RenderStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_render_budget(mut self, budget: Duration) -> Self {
        self.render_budget = budget;
        self
    }

    /// Build both providers and the policy/style from configuration. One
    /// provider may lack credentials; it is then reported as unavailable on
    /// every run.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        if !ProviderId::all().iter().any(|id| config.is_provider_configured(*id)) {
            anyhow::bail!(
                "No forecast provider is configured.\n\
                 Hint: run `forecast configure metno` or `forecast configure openweather`."
            );
        }
        let model_a = provider_or_unconfigured(ProviderId::MetNo, config)?;
        let model_b = provider_or_unconfigured(ProviderId::OpenWeather, config)?;
        let style = RenderStyle { signature: config.signature.clone(), timezone: config.timezone()? };

        Ok(Self::new(Arc::from(model_a), Arc::from(model_b))
            .with_policy(config.alignment_policy()?)
            .with_style(style)
            .with_render_budget(config.render_budget()))
    }

    pub fn style(&self) -> &RenderStyle {
        &self.style
    }

    /// Both provider timeouts plus the rendering budget.
    pub fn deadline(&self) -> Duration {
        self.model_a.timeout() + self.model_b.timeout() + self.render_budget
    }

    /// Produce one comparison for `coordinate` with the axis anchored at `now`.
    pub async fn run(
        &self,
        coordinate: Option<&Coordinate>,
        now: DateTime<Utc>,
    ) -> Result<ComparisonResult, RunFailure> {
        let coordinate = coordinate
            .ok_or_else(|| RunFailure::NotConfigured("no coordinates set".into()))?
            .clone();
        coordinate.validate().map_err(|e| RunFailure::NotConfigured(e.to_string()))?;

        let deadline = self.deadline();
        match tokio::time::timeout(deadline, self.run_stages(coordinate, now)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(deadline_secs = deadline.as_secs(), "comparison run timed out");
                Err(RunFailure::Timeout(deadline))
            }
        }
    }

    async fn run_stages(
        &self,
        coordinate: Coordinate,
        now: DateTime<Utc>,
    ) -> Result<ComparisonResult, RunFailure> {
        let mut stage = RunStage::Idle;
        advance(&mut stage, RunStage::Fetching);

        let (a, b) =
            tokio::join!(self.model_a.fetch(&coordinate), self.model_b.fetch(&coordinate));

        let mut warnings = Vec::new();
        let (series_a, series_b) = match (a, b) {
            (Err(model_a), Err(model_b)) => {
                log_provider_failure(&model_a);
                log_provider_failure(&model_b);
                return Err(RunFailure::BothProvidersUnavailable { model_a, model_b });
            }
            (a, b) => (
                self.absorb(self.model_a.id(), a, &mut warnings),
                self.absorb(self.model_b.id(), b, &mut warnings),
            ),
        };

        advance(&mut stage, RunStage::Normalizing);
        let axis: ForecastAxis = self.policy.build_axis(now);
        let comparison = Comparison {
            model_a: self.policy.align(&series_a, &axis),
            model_b: self.policy.align(&series_b, &axis),
            axis,
        };

        for series in comparison.series() {
            let failed = warnings.iter().any(|w| w.provider() == series.provider);
            if series.is_all_missing() && !failed {
                tracing::warn!(provider = %series.provider, "no samples within the forecast window");
                warnings.push(DegradationWarning::NoUsableData { provider: series.provider });
            }
        }

        advance(&mut stage, RunStage::Rendering);
        let style = self.style.clone();
        let to_render = comparison.clone();
        let image = tokio::task::spawn_blocking(move || {
            render_comparison(&to_render, &coordinate, &style)
        })
        .await
        .map_err(|e| RunFailure::Render(e.to_string()))??;

        advance(&mut stage, RunStage::Done);
        tracing::info!(
            bytes = image.len(),
            warnings = warnings.len(),
            "comparison rendered"
        );

        Ok(ComparisonResult { comparison, image, warnings })
    }

    /// Turn a failed fetch into an empty series plus a warning.
    fn absorb(
        &self,
        provider: ProviderId,
        outcome: Result<ForecastSeries, ProviderError>,
        warnings: &mut Vec<DegradationWarning>,
    ) -> ForecastSeries {
        match outcome {
            Ok(series) => series,
            Err(error) => {
                log_provider_failure(&error);
                warnings.push(DegradationWarning::Unavailable { provider, error });
                ForecastSeries::empty(provider)
            }
        }
    }
}

fn advance(stage: &mut RunStage, next: RunStage) {
    tracing::debug!(from = ?*stage, to = ?next, "pipeline stage");
    *stage = next;
}

fn log_provider_failure(error: &ProviderError) {
    match error {
        ProviderError::SchemaMismatch { provider, detail } => {
            tracing::error!(%provider, %detail, "provider response format changed; parser needs updating")
        }
        ProviderError::RateLimited { provider, retry_after_secs } => {
            tracing::warn!(%provider, ?retry_after_secs, "provider rate limited the request")
        }
        ProviderError::NetworkFailure { provider, detail } => {
            tracing::warn!(%provider, %detail, "provider unreachable")
        }
        ProviderError::NotConfigured { provider } => {
            tracing::warn!(%provider, "provider skipped, credentials not configured")
        }
        ProviderError::InvalidCoordinate(detail) => {
            tracing::warn!(%detail, "provider rejected coordinates")
        }
    }
}

/// Admits at most one active run per chat; extra triggers are dropped.
#[derive(Debug, Default)]
pub struct RunGate {
    active: Mutex<HashSet<ChatId>>,
}

impl RunGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when `chat` already has a run in flight.
    pub fn try_acquire(&self, chat: ChatId) -> Option<RunPermit<'_>> {
        // The guard must be gone before a permit exists: dropping a permit
        // locks `active` again.
        let admitted = self.active.lock().insert(chat);
        admitted.then(|| RunPermit { gate: self, chat })
    }

    pub fn is_active(&self, chat: ChatId) -> bool {
        self.active.lock().contains(&chat)
    }
}

/// Releases the chat's slot on drop.
#[derive(Debug)]
pub struct RunPermit<'a> {
    gate: &'a RunGate,
    chat: ChatId,
}

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        self.gate.active.lock().remove(&self.chat);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::provider::UnconfiguredProvider;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn coordinate() -> Coordinate {
        Coordinate::new(55.75, 37.62, "Moscow").unwrap()
    }

    fn pipeline(a: &Arc<FakeProvider>, b: &Arc<FakeProvider>) -> Pipeline {
        Pipeline::new(a.clone(), b.clone())
    }

    #[tokio::test]
    async fn two_healthy_providers_give_image_without_warnings() {
        let a = Arc::new(FakeProvider::healthy(ProviderId::MetNo, now(), 0.0));
        let b = Arc::new(FakeProvider::healthy(ProviderId::OpenWeather, now(), 1.0));

        let result = pipeline(&a, &b).run(Some(&coordinate()), now()).await.expect("success");

        assert!(result.warnings.is_empty());
        assert!(!result.image.is_empty());
        assert_eq!(result.comparison.axis.len(), 40);
        assert_eq!(result.comparison.model_a.present_count(), 40);
        assert_eq!(result.comparison.model_b.present_count(), 40);
        assert_eq!((a.calls(), b.calls()), (1, 1));
    }

    #[tokio::test]
    async fn one_failed_provider_degrades_with_single_warning() {
        let a = Arc::new(FakeProvider::failing(ProviderId::MetNo, network_failure(ProviderId::MetNo)));
        let b = Arc::new(FakeProvider::healthy(ProviderId::OpenWeather, now(), 1.0));

        let result = pipeline(&a, &b).run(Some(&coordinate()), now()).await.expect("degraded");

        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].provider(), ProviderId::MetNo);
        assert!(result.warnings[0].to_string().contains("Model-A"));
        assert!(result.comparison.model_a.is_all_missing());
        assert_eq!(result.comparison.model_b.present_count(), 40);
        assert!(!result.image.is_empty());
    }

    #[tokio::test]
    async fn schema_drift_is_reported_distinctly() {
        let drift = ProviderError::SchemaMismatch {
            provider: ProviderId::OpenWeather,
            detail: "missing field `list`".into(),
        };
        let a = Arc::new(FakeProvider::healthy(ProviderId::MetNo, now(), 0.0));
        let b = Arc::new(FakeProvider::failing(ProviderId::OpenWeather, drift.clone()));

        let result = pipeline(&a, &b).run(Some(&coordinate()), now()).await.expect("degraded");

        assert_eq!(
            result.warnings,
            vec![DegradationWarning::Unavailable { provider: ProviderId::OpenWeather, error: drift }]
        );
        assert!(result.warnings[0].to_string().contains("unexpected response format"));
    }

    #[tokio::test]
    async fn both_failed_providers_fail_the_run() {
        let a = Arc::new(FakeProvider::failing(ProviderId::MetNo, network_failure(ProviderId::MetNo)));
        let b = Arc::new(FakeProvider::failing(
            ProviderId::OpenWeather,
            ProviderError::RateLimited { provider: ProviderId::OpenWeather, retry_after_secs: None },
        ));

        let err = pipeline(&a, &b).run(Some(&coordinate()), now()).await.unwrap_err();

        assert!(matches!(err, RunFailure::BothProvidersUnavailable { .. }));
        assert!(!err.user_message().contains("connection refused"));
    }

    #[tokio::test]
    async fn missing_coordinate_short_circuits_before_fetching() {
        let a = Arc::new(FakeProvider::healthy(ProviderId::MetNo, now(), 0.0));
        let b = Arc::new(FakeProvider::healthy(ProviderId::OpenWeather, now(), 1.0));
        let p = pipeline(&a, &b);

        let err = p.run(None, now()).await.unwrap_err();
        assert!(matches!(err, RunFailure::NotConfigured(_)));

        let invalid = Coordinate { latitude: 120.0, longitude: 0.0, place_name: "x".into() };
        let err = p.run(Some(&invalid), now()).await.unwrap_err();
        assert!(matches!(err, RunFailure::NotConfigured(_)));

        assert_eq!((a.calls(), b.calls()), (0, 0));
    }

    #[tokio::test]
    async fn stale_data_everywhere_is_nothing_to_render() {
        let stale = now() - chrono::Duration::days(30);
        let a = Arc::new(FakeProvider::healthy(ProviderId::MetNo, stale, 0.0));
        let b = Arc::new(FakeProvider::failing(
            ProviderId::OpenWeather,
            network_failure(ProviderId::OpenWeather),
        ));

        let err = pipeline(&a, &b).run(Some(&coordinate()), now()).await.unwrap_err();
        assert_eq!(err, RunFailure::NothingToRender);
    }

    #[tokio::test]
    async fn provider_without_usable_points_gets_no_data_warning() {
        let stale = now() - chrono::Duration::days(30);
        let a = Arc::new(FakeProvider::healthy(ProviderId::MetNo, stale, 0.0));
        let b = Arc::new(FakeProvider::healthy(ProviderId::OpenWeather, now(), 1.0));

        let result = pipeline(&a, &b).run(Some(&coordinate()), now()).await.expect("degraded");
        assert_eq!(
            result.warnings,
            vec![DegradationWarning::NoUsableData { provider: ProviderId::MetNo }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overall_deadline_turns_into_timeout() {
        let mut slow = FakeProvider::healthy(ProviderId::MetNo, now(), 0.0);
        slow.delay = Duration::from_secs(60);
        let a = Arc::new(slow);
        let b = Arc::new(FakeProvider::healthy(ProviderId::OpenWeather, now(), 1.0));

        let p = pipeline(&a, &b).with_render_budget(Duration::from_secs(1));
        assert_eq!(p.deadline(), Duration::from_secs(11));

        let err = p.run(Some(&coordinate()), now()).await.unwrap_err();
        assert_eq!(err, RunFailure::Timeout(Duration::from_secs(11)));
    }

    #[test]
    fn from_config_needs_at_least_one_provider() {
        let err = Pipeline::from_config(&Config::default()).unwrap_err();
        assert!(err.to_string().contains("No forecast provider is configured"));

        let mut config = Config::default();
        config.set_user_agent(ProviderId::MetNo, "bot/1.0 (ops@example.com)".into());
        assert!(Pipeline::from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn provider_without_credentials_degrades_to_one_sided_chart() {
        let a = Arc::new(FakeProvider::healthy(ProviderId::MetNo, now(), 0.0));
        let p = Pipeline::new(a, Arc::new(UnconfiguredProvider::new(ProviderId::OpenWeather)));

        let result = p.run(Some(&coordinate()), now()).await.expect("one-sided chart");

        assert_eq!(
            result.warnings,
            vec![DegradationWarning::Unavailable {
                provider: ProviderId::OpenWeather,
                error: ProviderError::NotConfigured { provider: ProviderId::OpenWeather },
            }]
        );
        assert!(result.warnings[0].to_string().contains("not configured"));
        assert_eq!(result.comparison.model_a.present_count(), 40);
        assert!(result.comparison.model_b.is_all_missing());
    }

    #[test]
    fn busy_chat_is_refused_without_blocking() {
        let gate = Arc::new(RunGate::new());
        let held = gate.try_acquire(7).expect("free");

        let (tx, rx) = std::sync::mpsc::channel();
        let other = gate.clone();
        std::thread::spawn(move || {
            let _ = tx.send(other.try_acquire(7).is_none());
        });

        let refused = rx.recv_timeout(Duration::from_secs(3)).expect("try_acquire returned");
        assert!(refused);
        drop(held);
    }

    #[test]
    fn gate_admits_one_run_per_chat() {
        let gate = RunGate::new();

        let first = gate.try_acquire(7).expect("free");
        assert!(gate.try_acquire(7).is_none());
        assert!(gate.try_acquire(8).is_some());
        assert!(gate.is_active(7));

        drop(first);
        assert!(!gate.is_active(7));
        assert!(gate.try_acquire(7).is_some());
    }
}
