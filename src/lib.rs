//! BuffetApp POS - till reconciliation engine
//!
//! Library behind the `buffet-pos` command line: catalog, checkout, ticket
//! printing, till open/close reconciliation, reports, local backups and
//! mirroring of closed tills to a Supabase-compatible endpoint.

use std::path::PathBuf;

use tracing::{info, warn};

pub mod backup;
pub mod catalog;
pub mod cli;
pub mod cloud_sync;
pub mod config;
pub mod db;
pub mod error;
pub mod escpos;
pub mod logging;
pub mod movements;
pub mod print;
pub mod receipt;
pub mod report;
pub mod sales;
pub mod storage;
pub mod terminal;
pub mod till;
pub mod users;

use crate::config::DeviceConfig;
use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::terminal::PosIdentity;

/// Everything an operation needs once the app has started.
pub struct AppContext {
    pub data_dir: PathBuf,
    pub db: DbState,
    pub config: DeviceConfig,
    pub pos: PosIdentity,
}

impl AppContext {
    pub fn print_settings(&self) -> print::PrintSettings {
        print::PrintSettings::from_config(&self.config, &self.data_dir)
    }

    pub fn backup_dir(&self) -> PathBuf {
        config::backup_dir(&self.data_dir)
    }
}

/// Open the database, load the device config and make sure this POS and the
/// default accounts exist.
pub fn bootstrap(data_dir: PathBuf) -> PosResult<AppContext> {
    std::fs::create_dir_all(&data_dir)?;

    // Schema creation runs while the config is read.
    let db_init = db::init_in_background(data_dir.clone());
    let config = DeviceConfig::load_or_init(&data_dir)?;
    let db = db_init
        .join()
        .map_err(|_| PosError::Config("database initialization thread panicked".into()))??;

    let pos = terminal::ensure_local_pos(&db, &config)?;
    if users::ensure_default_users(&db)? > 0 {
        warn!("Default accounts created; change their passwords");
    }
    users::upgrade_legacy_passwords(&db)?;

    info!(
        pos_uuid = %pos.pos_uuid,
        device = %config.device_name,
        git_sha = env!("BUILD_GIT_SHA"),
        built = env!("BUILD_TIMESTAMP"),
        "BuffetApp POS v{} ready",
        env!("CARGO_PKG_VERSION")
    );
    Ok(AppContext {
        data_dir,
        db,
        config,
        pos,
    })
}
