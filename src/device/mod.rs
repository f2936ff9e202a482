//! Device side of an experiment: the app lifecycle on a phone or emulator and the
//! interception proxy that records its traffic.

pub mod android;
pub mod app_meta;
pub mod capture;

use crate::errors::AppResult;
use crate::models::{AppMeta, AppPackage, Platform, TrafficCapture};

/// Exclusive handle on one device for the duration of an experiment.
///
/// Implementations are driven strictly sequentially by the run loop; no method is ever
/// called concurrently with another.
#[allow(async_fn_in_trait)]
pub trait DeviceSession {
    fn platform(&self) -> Platform;

    /// Waits until the device accepts commands. May take minutes on a cold emulator.
    async fn ensure_device(&mut self) -> AppResult<()>;

    /// Restores the clean snapshot.
    async fn reset_device(&mut self) -> AppResult<()>;

    async fn read_app_meta(&mut self, package: &AppPackage) -> AppResult<AppMeta>;

    async fn install_app(&mut self, package: &AppPackage) -> AppResult<()>;

    /// Returns whether something was removed; an absent app is not an error.
    async fn uninstall_app(&mut self, app_id: &str) -> AppResult<bool>;

    async fn grant_permissions(&mut self, app_id: &str) -> AppResult<()>;

    async fn start_traffic_collection(&mut self, app_id: &str) -> AppResult<()>;

    async fn stop_traffic_collection(&mut self) -> AppResult<TrafficCapture>;

    /// Tears down a capture without collecting it, used on failed cells.
    async fn abort_traffic_collection(&mut self) -> AppResult<()>;

    async fn start_app(&mut self, app_id: &str) -> AppResult<()>;

    async fn foreground_app_id(&mut self) -> AppResult<Option<String>>;

    async fn stop(&mut self) -> AppResult<()>;
}
