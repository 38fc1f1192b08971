// Public modules
pub mod api;
pub mod auth;
pub mod domains;
pub mod errors;
pub mod globals;
pub mod types;
pub mod validation;

// Private modules
mod db_migration;

#[cfg(test)]
mod testing;

use errors::ServiceResult;

/// Install the env_logger backend. Defaults to `info` unless RUST_LOG says otherwise.
/// Calling it again is a no-op.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

/// Entry point for initialization.
/// Reads settings from the environment, opens the database, runs migrations and
/// starts the job worker. Must be called before any API call.
pub async fn initialize() -> ServiceResult<()> {
    let settings = globals::Settings::from_env()?;
    globals::initialize(settings).await
}

/// Stop background jobs
pub async fn shutdown() -> ServiceResult<()> {
    globals::shutdown().await
}
