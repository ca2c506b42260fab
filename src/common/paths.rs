use std::path::PathBuf;
use directories::ProjectDirs;
use crate::common::error::{FaceIdError, Result};

pub const DATABASE_FILE: &str = "faceid.db";

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/faceid/faceid.toml")
}

pub fn system_database_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "faceid", "FaceId")
        .ok_or_else(|| FaceIdError::Storage("Failed to get project dirs".into()))?;
    Ok(dirs.data_dir().join(DATABASE_FILE))
}
