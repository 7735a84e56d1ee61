pub mod cli;

use crate::core::config_transform::ReferencePaths;
use crate::domain::model::{InstallDirs, PortRange};
use crate::utils::error::{Result, SupervisorError};
use crate::utils::validation::{
    validate_numeric, validate_path, validate_range, validate_non_empty_string, Validate,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_BASE_DIR: &str = "./config";
pub const DEFAULT_FETCH_TIMEOUT_SECONDS: u64 = 1800;
pub const DEFAULT_PLAYLIST_REFERENCE_ROOT: &str = "/rom/data/workshop_missions";

fn default_config_base_dir() -> String {
    DEFAULT_CONFIG_BASE_DIR.to_string()
}

fn default_fetch_timeout_seconds() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECONDS
}

fn default_playlist_reference_root() -> String {
    DEFAULT_PLAYLIST_REFERENCE_ROOT.to_string()
}

/// 監督程式的執行設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub server_exe_path: String,
    #[serde(default)]
    pub server_args: Vec<String>,
    pub min_port: u16,
    pub max_port: u16,
    #[serde(default = "default_config_base_dir")]
    pub config_base_dir: String,
    pub playlists_install_dir: String,
    pub mods_install_dir: String,
    pub steamcmd_path: String,
    pub game_app_id: String,
    /// 0 表示不設逾時
    #[serde(default = "default_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,
    #[serde(default = "default_playlist_reference_root")]
    pub playlist_reference_root: String,
    /// 未設定時使用 `mods_install_dir`
    #[serde(default)]
    pub mod_reference_root: Option<String>,
}

impl SupervisorConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| SupervisorError::ConfigError {
            message: format!("cannot read {}: {}", path.as_ref().display(), e),
        })?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| SupervisorError::ConfigError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${STEAMCMD_PATH})；未定義的保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| SupervisorError::ConfigError {
            message: format!("invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    /// 從環境變數載入配置
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| SupervisorError::MissingConfigError {
                    field: key.to_string(),
                })
        };

        Ok(Self {
            server_exe_path: required("SERVER_EXE_PATH")?,
            server_args: lookup("SERVER_ARGS")
                .map(|args| args.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            min_port: parse_port("MIN_PORT", &required("MIN_PORT")?)?,
            max_port: parse_port("MAX_PORT", &required("MAX_PORT")?)?,
            config_base_dir: lookup("CONFIG_BASE_DIR").unwrap_or_else(default_config_base_dir),
            playlists_install_dir: required("WORKSHOP_PLAYLISTS_INSTALL_DIR")?,
            mods_install_dir: required("WORKSHOP_MODS_INSTALL_DIR")?,
            steamcmd_path: required("STEAMCMD_PATH")?,
            game_app_id: required("GAME_APPID")?,
            fetch_timeout_seconds: match lookup("FETCH_TIMEOUT_SECONDS") {
                Some(value) => value.trim().parse().map_err(|_| {
                    SupervisorError::InvalidConfigValueError {
                        field: "FETCH_TIMEOUT_SECONDS".to_string(),
                        value: value.clone(),
                        reason: "must be a whole number of seconds".to_string(),
                    }
                })?,
                None => DEFAULT_FETCH_TIMEOUT_SECONDS,
            },
            playlist_reference_root: lookup("PLAYLIST_REFERENCE_ROOT")
                .unwrap_or_else(default_playlist_reference_root),
            mod_reference_root: lookup("MOD_REFERENCE_ROOT"),
        })
    }

    pub fn port_range(&self) -> PortRange {
        PortRange::new(self.min_port, self.max_port)
    }

    pub fn install_dirs(&self) -> InstallDirs {
        InstallDirs {
            playlists: PathBuf::from(&self.playlists_install_dir),
            mods: PathBuf::from(&self.mods_install_dir),
        }
    }

    pub fn reference_paths(&self) -> ReferencePaths {
        ReferencePaths::new(
            self.playlist_reference_root.clone(),
            self.mod_reference_root
                .clone()
                .unwrap_or_else(|| self.mods_install_dir.clone()),
        )
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_seconds > 0).then(|| Duration::from_secs(self.fetch_timeout_seconds))
    }
}

fn parse_port(field: &str, value: &str) -> Result<u16> {
    let port: u32 = value
        .trim()
        .parse()
        .map_err(|_| SupervisorError::InvalidConfigValueError {
            field: field.to_string(),
            value: value.to_string(),
            reason: "must be a port number".to_string(),
        })?;
    validate_range(field, port, 1024, 65535)?;
    // 上面已限制在 u16 範圍內
    Ok(port as u16)
}

impl Validate for SupervisorConfig {
    fn validate(&self) -> Result<()> {
        validate_path("server_exe_path", &self.server_exe_path)?;
        validate_path("config_base_dir", &self.config_base_dir)?;
        validate_path("playlists_install_dir", &self.playlists_install_dir)?;
        validate_path("mods_install_dir", &self.mods_install_dir)?;
        validate_path("steamcmd_path", &self.steamcmd_path)?;
        validate_non_empty_string("game_app_id", &self.game_app_id)?;
        validate_numeric("game_app_id", &self.game_app_id)?;

        validate_range("min_port", self.min_port, 1024, u16::MAX)?;
        validate_range("max_port", self.max_port, 1024, u16::MAX)?;
        if self.min_port > self.max_port {
            return Err(SupervisorError::InvalidConfigValueError {
                field: "min_port".to_string(),
                value: self.min_port.to_string(),
                reason: format!("must not be greater than max_port ({})", self.max_port),
            });
        }

        if let Some(root) = &self.mod_reference_root {
            validate_path("mod_reference_root", root)?;
        }
        validate_path("playlist_reference_root", &self.playlist_reference_root)?;

        Ok(())
    }
}
