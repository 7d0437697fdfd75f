//! 配置管理模块
//!
//! 使用 TOML 文件存储配置，遵循 XDG 规范：
//! - Linux: ~/.config/mirage/Mirage/config.toml
//! - macOS: ~/Library/Application Support/com.mirage.Mirage/config.toml
//! - Windows: %APPDATA%\mirage\Mirage\config.toml

use anyhow::{anyhow, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// 生成参数配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// 采样温度
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Top-K 采样阈值
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    /// 每会话可附加的图像上限（纯文本模型也按此配置，保持探测一致）
    #[serde(default = "default_max_images")]
    pub max_images: u32,
}

fn default_temperature() -> f32 {
    0.8
}
fn default_top_k() -> i32 {
    40
}
fn default_max_images() -> u32 {
    1
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            max_images: default_max_images(),
        }
    }
}

/// 运行时行为配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 多模态生成的时间预算（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 等待期间存活日志的输出间隔（秒）
    #[serde(default = "default_liveness_tick_secs")]
    pub liveness_tick_secs: u64,
    /// 图像最大边长（像素）
    #[serde(default = "default_image_bound_px")]
    pub image_bound_px: u32,
    /// 能力探测因非加速器原因失败时是否降级为纯文本模型
    ///
    /// 默认关闭：沿用"失败也按多模态处理"的乐观策略。
    #[serde(default)]
    pub strict_capability_probe: bool,
}

fn default_timeout_secs() -> u64 {
    90
}
fn default_liveness_tick_secs() -> u64 {
    5
}
fn default_image_bound_px() -> u32 {
    crate::media::DEFAULT_BOUND_PX
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            liveness_tick_secs: default_liveness_tick_secs(),
            image_bound_px: default_image_bound_px(),
            strict_capability_probe: false,
        }
    }
}

/// 应用配置（顶层结构）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 生成参数配置
    #[serde(default)]
    pub generation: GenerationConfig,
    /// 运行时行为配置
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl AppConfig {
    /// 获取配置目录路径
    pub fn config_dir() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("com", "mirage", "Mirage") {
            Ok(proj_dirs.config_dir().to_path_buf())
        } else {
            // 回退到 ~/.mirage
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot find home directory"))?;
            Ok(home.join(".mirage"))
        }
    }

    /// 获取配置文件完整路径
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// 从文件加载配置
    ///
    /// 如果文件不存在，返回默认配置并创建文件
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!("Loading config from: {}", path.display());

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let config: Self = toml::from_str(&content).map_err(|e| {
                warn!("Failed to parse config file: {}, using defaults", e);
                e
            })?;
            info!("Config loaded from: {}", path.display());
            Ok(config)
        } else {
            info!("Config file not found, creating default at: {}", path.display());
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// 保存配置到文件
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let dir = path.parent().ok_or_else(|| anyhow!("Invalid config path"))?;

        // 确保目录存在
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            debug!("Created config directory: {}", dir.display());
        }

        // 序列化为 TOML
        let content = toml::to_string_pretty(self)?;

        // 写入文件
        fs::write(&path, &content)?;

        // 设置文件权限 (Unix only) - 仅用户可读写
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&path, perms)?;
        }

        info!("Config saved to: {}", path.display());
        Ok(())
    }
}
