//! Container registry protocol server
//!
//! Every running container repository gets its own listener speaking the
//! distribution protocol on a dedicated port. Listeners translate wire
//! requests into plugin paths and go through the repository router, so the
//! same hosted storage, proxy cache and group resolution apply.

pub mod app;
pub mod auth;
pub mod listener;
pub mod uploads;

pub use app::{listener_app, ListenerState, OciError, API_VERSION_HEADER};
pub use auth::{Caller, ListenerAccess};
pub use listener::{ListenerManager, RegistryListener};
pub use uploads::{spawn_upload_reaper, UploadError, UploadSessions, UploadStatus};
