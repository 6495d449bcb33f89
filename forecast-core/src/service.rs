//! Operations exposed to the chat layer and to the external scheduler.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    model::{ChatId, Coordinate, UserId},
    pipeline::{DegradationWarning, Pipeline, RunFailure, RunGate},
    provider::ProviderError,
    settings::{SettingUpdate, SettingsStore},
};

/// What the chat layer posts after a successful run.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub image: Vec<u8>,
    pub caption: String,
    pub warnings: Vec<DegradationWarning>,
}

/// Why an admin command was refused.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("only the admin can do this")]
    NotAdmin,
    #[error(transparent)]
    InvalidCoordinate(#[from] ProviderError),
    #[error("settings storage failed: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl CommandError {
    /// Plain-text reply for the chat.
    pub fn user_message(&self) -> String {
        match self {
            CommandError::NotAdmin => "Only the admin can do this.".to_string(),
            CommandError::InvalidCoordinate(_) => {
                "Coordinates must be numbers within range. Example: /setcoords 55.75 37.62"
                    .to_string()
            }
            CommandError::Storage(_) => {
                "Could not save the setting. Please try again later.".to_string()
            }
        }
    }
}

pub const HELP_TEXT: &str = "\
/setadmin [id] - assign the admin (current admin only, or anyone while unset)
/setcoords <lat> <lon> - set coordinates for this chat (admin only)
/forecast - get a fresh comparison
/stopforecast - stop scheduled delivery (admin only)
/startforecast - resume scheduled delivery (admin only)
/help - this help";

/// Admin-only settings commands. Usable without provider credentials.
#[derive(Clone)]
pub struct AdminCommands {
    store: Arc<dyn SettingsStore>,
}

impl std::fmt::Debug for AdminCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCommands").finish_non_exhaustive()
    }
}

impl AdminCommands {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    /// Set the chat's coordinate. Admin only; also enables scheduled delivery.
    pub fn update_coordinate(
        &self,
        chat: ChatId,
        caller: UserId,
        latitude: f64,
        longitude: f64,
        place_name: &str,
    ) -> Result<Coordinate, CommandError> {
        self.require_admin(chat, caller)?;
        let coordinate = Coordinate::new(latitude, longitude, place_name.trim())?;

        self.store.set_all(chat, vec![
            SettingUpdate::Coordinate(coordinate.clone()),
            SettingUpdate::ScheduleEnabled(true),
        ])?;
        tracing::info!(chat, latitude, longitude, place = %coordinate.place_name, "coordinates updated");

        Ok(coordinate)
    }

    /// Assign the admin. Anyone may claim the role while it is unset;
    /// afterwards only the current admin can hand it over. Without a
    /// `target` the caller becomes admin.
    pub fn set_admin(
        &self,
        chat: ChatId,
        caller: UserId,
        target: Option<UserId>,
    ) -> Result<UserId, CommandError> {
        let current = self.store.get(chat)?.admin_id;
        if current.is_some_and(|admin| admin != caller) {
            return Err(CommandError::NotAdmin);
        }

        let new_admin = target.unwrap_or(caller);
        self.store.set(chat, SettingUpdate::Admin(new_admin))?;
        tracing::info!(chat, new_admin, "admin assigned");
        Ok(new_admin)
    }

    /// Turn scheduled delivery for `chat` on or off. Admin only. A run
    /// already in flight still completes.
    pub fn set_schedule(
        &self,
        chat: ChatId,
        caller: UserId,
        enabled: bool,
    ) -> Result<(), CommandError> {
        self.require_admin(chat, caller)?;
        self.store.set(chat, SettingUpdate::ScheduleEnabled(enabled))?;
        tracing::info!(chat, enabled, "schedule toggled");
        Ok(())
    }

    fn require_admin(&self, chat: ChatId, caller: UserId) -> Result<(), CommandError> {
        match self.store.get(chat)?.admin_id {
            Some(admin) if admin == caller => Ok(()),
            _ => Err(CommandError::NotAdmin),
        }
    }
}

/// Chat-facing entry points around one [`Pipeline`] and a settings store.
pub struct ForecastService {
    store: Arc<dyn SettingsStore>,
    admin: AdminCommands,
    pipeline: Pipeline,
    gate: RunGate,
}

impl std::fmt::Debug for ForecastService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForecastService")
            .field("pipeline", &self.pipeline)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl ForecastService {
    pub fn new(store: Arc<dyn SettingsStore>, pipeline: Pipeline) -> Self {
        Self { admin: AdminCommands::new(store.clone()), store, pipeline, gate: RunGate::new() }
    }

    pub fn help_text(&self) -> &'static str {
        HELP_TEXT
    }

    pub fn admin(&self) -> &AdminCommands {
        &self.admin
    }

    /// Produce the current comparison for `chat`. A trigger arriving while a
    /// run for the same chat is in flight gets `AlreadyRunning` and should be
    /// dropped by the caller.
    pub async fn run_comparison(
        &self,
        chat: ChatId,
        now: DateTime<Utc>,
    ) -> Result<Delivery, RunFailure> {
        let Some(_permit) = self.gate.try_acquire(chat) else {
            tracing::debug!(chat, "run already in progress, dropping trigger");
            return Err(RunFailure::AlreadyRunning);
        };

        let settings = self.store.get(chat).map_err(|e| RunFailure::Storage(format!("{e:#}")))?;
        let coordinate = settings.coordinate;

        let result = self.pipeline.run(coordinate.as_ref(), now).await?;

        let place = coordinate.as_ref().map(Coordinate::display_name).unwrap_or("unknown");
        let caption = caption(&self.pipeline.style().signature, place, &result.warnings);

        Ok(Delivery { image: result.image, caption, warnings: result.warnings })
    }

    pub fn update_coordinate(
        &self,
        chat: ChatId,
        caller: UserId,
        latitude: f64,
        longitude: f64,
        place_name: &str,
    ) -> Result<Coordinate, CommandError> {
        self.admin.update_coordinate(chat, caller, latitude, longitude, place_name)
    }

    pub fn set_admin(
        &self,
        chat: ChatId,
        caller: UserId,
        target: Option<UserId>,
    ) -> Result<UserId, CommandError> {
        self.admin.set_admin(chat, caller, target)
    }

    pub fn set_schedule(
        &self,
        chat: ChatId,
        caller: UserId,
        enabled: bool,
    ) -> Result<(), CommandError> {
        self.admin.set_schedule(chat, caller, enabled)
    }

    /// Entry point for the external clock: one run per chat that has
    /// coordinates and the schedule enabled.
    pub async fn scheduled_tick(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<(ChatId, Result<Delivery, RunFailure>)>> {
        let mut results = Vec::new();
        for chat in self.store.chats()? {
            let settings = self.store.get(chat)?;
            if !settings.schedule_enabled || settings.coordinate.is_none() {
                continue;
            }
            let outcome = self.run_comparison(chat, now).await;
            if let Err(e) = &outcome {
                tracing::warn!(chat, error = %e, "scheduled delivery failed");
            }
            results.push((chat, outcome));
        }
        Ok(results)
    }
}

/// `"<signature> — <place>"` plus one note line per degraded provider.
pub fn caption(signature: &str, place: &str, warnings: &[DegradationWarning]) -> String {
    let mut caption = format!("{signature} — {place}");
    for warning in warnings {
        caption.push_str("\nNote: ");
        caption.push_str(&warning.to_string());
    }
    caption
}
