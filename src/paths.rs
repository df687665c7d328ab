use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR_ENV: &str = "STACKPANEL_CONFIG_DIR";
pub const CONFIG_FILE_NAME: &str = "stackpanel.toml";

#[derive(Clone)]
pub struct Paths {
    config_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_DIR_ENV) {
            return Ok(Self {
                config_dir: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::config_dir() else {
            bail!("could not determine config directory");
        };
        Ok(Self {
            config_dir: base.join("stackpanel"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { config_dir: base }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }
}
