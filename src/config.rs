// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section has defaults, so a missing file, a missing section or a
// missing key all fall back to them. A file that fails to parse is reported
// and ignored.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use winit::keyboard::KeyCode;

use crate::backend::{FatalPolicy, Gate};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub assets: AssetsConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "QC Engine".to_string(),
            width: 1700,
            height: 900,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Upper bound for the fence wait and image acquisition. Exceeding it
    /// is treated as a hung GPU.
    pub frame_timeout_ms: u64,
    pub clear_depth: f32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 1000,
            clear_depth: 1.0,
        }
    }
}

/// Shader binaries and model file
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    /// Fragment shader of the second pipeline, selected with the toggle key
    pub alt_fragment_shader: PathBuf,
    /// OBJ model to draw. The built-in triangle is used when this is unset
    /// or cannot be imported.
    pub mesh: Option<PathBuf>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            vertex_shader: PathBuf::from("shaders/tri_mesh.vert.spv"),
            fragment_shader: PathBuf::from("shaders/colored_triangle.frag.spv"),
            alt_fragment_shader: PathBuf::from("shaders/normal_shaded.frag.spv"),
            mesh: Some(PathBuf::from("assets/cube.obj")),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    /// Panic at the failing call instead of unwinding to main
    pub panic_on_fatal: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
            panic_on_fatal: false,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub quit_key: String,
    pub toggle_pipeline_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            quit_key: "Escape".to_string(),
            toggle_pipeline_key: "Space".to_string(),
        }
    }
}

impl Config {
    /// Load `config.toml`, falling back to defaults on any error.
    ///
    /// The config picks the log level, so this runs before logging is up;
    /// the error is handed back for the caller to log afterwards.
    pub fn load() -> (Self, Option<anyhow::Error>) {
        Self::load_or_default("config.toml")
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.graphics.frame_timeout_ms)
    }

    /// Result gate configured from `debug.panic_on_fatal`
    pub fn gate(&self) -> Gate {
        Gate::new(if self.debug.panic_on_fatal {
            FatalPolicy::Panic
        } else {
            FatalPolicy::Propagate
        })
    }

    pub fn quit_key(&self) -> Option<KeyCode> {
        parse_key(&self.controls.quit_key)
    }

    pub fn toggle_pipeline_key(&self) -> Option<KeyCode> {
        parse_key(&self.controls.toggle_pipeline_key)
    }
}

/// Map a key name from the config file to a winit key code.
pub fn parse_key(name: &str) -> Option<KeyCode> {
    let key = match name.trim().to_ascii_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "space" => KeyCode::Space,
        "enter" | "return" => KeyCode::Enter,
        "tab" => KeyCode::Tab,
        "backspace" => KeyCode::Backspace,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        "a" => KeyCode::KeyA,
        "b" => KeyCode::KeyB,
        "c" => KeyCode::KeyC,
        "d" => KeyCode::KeyD,
        "e" => KeyCode::KeyE,
        "f" => KeyCode::KeyF,
        "g" => KeyCode::KeyG,
        "h" => KeyCode::KeyH,
        "i" => KeyCode::KeyI,
        "j" => KeyCode::KeyJ,
        "k" => KeyCode::KeyK,
        "l" => KeyCode::KeyL,
        "m" => KeyCode::KeyM,
        "n" => KeyCode::KeyN,
        "o" => KeyCode::KeyO,
        "p" => KeyCode::KeyP,
        "q" => KeyCode::KeyQ,
        "r" => KeyCode::KeyR,
        "s" => KeyCode::KeyS,
        "t" => KeyCode::KeyT,
        "u" => KeyCode::KeyU,
        "v" => KeyCode::KeyV,
        "w" => KeyCode::KeyW,
        "x" => KeyCode::KeyX,
        "y" => KeyCode::KeyY,
        "z" => KeyCode::KeyZ,
        _ => return None,
    };
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_window() {
        let config = Config::default();
        assert_eq!(config.window.width, 1700);
        assert_eq!(config.window.height, 900);
        assert_eq!(config.frame_timeout(), Duration::from_secs(1));
        assert_eq!(config.graphics.clear_depth, 1.0);
        assert_eq!(config.gate().policy(), FatalPolicy::Propagate);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            title = "Test"

            [debug]
            panic_on_fatal = true
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "Test");
        assert_eq!(config.window.width, 1700);
        assert!(config.debug.validation_layers);
        assert_eq!(config.gate().policy(), FatalPolicy::Panic);
        assert_eq!(
            config.assets.vertex_shader,
            PathBuf::from("shaders/tri_mesh.vert.spv")
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window\nwidth = ").is_err());
        assert!(Config::parse("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("no/such/config.toml").unwrap();
        assert_eq!(config.window.title, "QC Engine");
    }

    #[test]
    fn malformed_file_falls_back_with_its_error() {
        let path = std::env::temp_dir().join(format!("qc-renderer-{}-bad.toml", std::process::id()));
        std::fs::write(&path, "[window]\nwidth = \"wide\"").unwrap();

        let (config, error) = Config::load_or_default(&path);
        std::fs::remove_file(&path).ok();

        assert_eq!(config.window.width, 1700);
        let error = error.expect("malformed file must report an error");
        assert!(format!("{:#}", error).contains("Failed to parse config file"));

        let (_, error) = Config::load_or_default("no/such/config.toml");
        assert!(error.is_none());
    }

    #[test]
    fn mesh_path_can_be_overridden() {
        let config = Config::parse("[assets]\nmesh = \"assets/monkey_smooth.obj\"").unwrap();
        assert_eq!(config.assets.mesh, Some(PathBuf::from("assets/monkey_smooth.obj")));
    }

    #[test]
    fn key_names_parse_case_insensitively() {
        assert_eq!(parse_key("Escape"), Some(KeyCode::Escape));
        assert_eq!(parse_key("SPACE"), Some(KeyCode::Space));
        assert_eq!(parse_key(" f11 "), Some(KeyCode::F11));
        assert_eq!(parse_key("q"), Some(KeyCode::KeyQ));
        assert_eq!(parse_key("Hyper"), None);

        let config = Config::default();
        assert_eq!(config.quit_key(), Some(KeyCode::Escape));
        assert_eq!(config.toggle_pipeline_key(), Some(KeyCode::Space));
    }
}
