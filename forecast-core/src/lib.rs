//! Core library for the `forecast` comparison bot.
//!
//! This crate defines:
//! - Configuration & per-chat settings storage
//! - Two forecast provider clients behind one trait
//! - Alignment of both series onto a shared 3-hourly axis
//! - Chart rendering and the run-once pipeline around it
//!
//! It is used by `forecast-cli`, but a chat bot front-end can drive
//! [`ForecastService`] directly.

pub mod config;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod provider;
pub mod render;
pub mod service;
pub mod settings;
pub mod summary;

pub use config::{Config, ProviderConfig};
pub use model::{
    AlignedSeries, ChatId, Comparison, Coordinate, ForecastAxis, ForecastPoint, ForecastSeries,
    UserId,
};
pub use normalize::AlignmentPolicy;
pub use pipeline::{ComparisonResult, DegradationWarning, Pipeline, RunFailure};
pub use provider::{ForecastProvider, ProviderError, ProviderId, UnconfiguredProvider};
pub use render::{RenderError, RenderStyle};
pub use service::{AdminCommands, CommandError, Delivery, ForecastService};
pub use settings::{BotSettings, FileSettingsStore, MemorySettingsStore, SettingsStore};
