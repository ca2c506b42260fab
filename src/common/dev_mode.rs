use std::path::PathBuf;
use std::fs;
use crate::common::error::Result;
use crate::common::paths;

#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        Self::with_base_dir(enabled, PathBuf::from("./dev_data"))
    }

    pub fn with_base_dir(enabled: bool, base_dir: PathBuf) -> Result<Self> {
        if enabled {
            fs::create_dir_all(base_dir.join("db"))?;
            tracing::info!("Development mode enabled - data will be saved to: {}", base_dir.display());
        }

        Ok(Self { enabled, base_dir })
    }

    pub fn config_file(&self) -> PathBuf {
        if self.enabled {
            PathBuf::from("configs/faceid.toml")
        } else {
            paths::system_config_file()
        }
    }

    /// Where the database lives when the config does not name a path.
    pub fn database_path(&self) -> Result<PathBuf> {
        if self.enabled {
            Ok(self.base_dir.join("db").join(paths::DATABASE_FILE))
        } else {
            paths::system_database_path()
        }
    }
}
