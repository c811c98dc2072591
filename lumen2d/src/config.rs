//! Lighting configuration.
//!
//! Values are loaded from JSON and may change while running. The raw
//! [`LightingConfig`] is what the user wrote; [`LightLimits`] is the
//! clamped form the renderer sizes its buffers from.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::color::Color;
use crate::error::{LightingError, Result};

/// Stencil values 0xFE and 0xFF are reserved for the wall and FOV masks,
/// and hard shadows use `index + 1` as the reference value.
pub const MAX_HARD_SHADOW_LIGHTS: usize = 253;
pub const MIN_OCCLUDERS: usize = 1024;
pub const MAX_OCCLUDERS: usize = 8192;
pub const MIN_LIGHT_RESOLUTION_SCALE: f32 = 0.05;

/// User-facing lighting settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingConfig {
    /// Master switch for the lighting pipeline.
    pub enabled: bool,
    /// Draw the light composition and post-processing passes.
    pub draw_lighting: bool,
    /// Render shadow depth maps. When off, shadow-casting lights draw unshadowed.
    pub draw_shadows: bool,
    pub max_light_count: usize,
    pub max_shadowcasting_lights: usize,
    pub max_occluder_count: usize,
    /// Light map size relative to the viewport.
    pub light_resolution_scale: f32,
    pub soft_shadows: bool,
    pub light_blur: bool,
    pub light_blur_factor: f32,
    /// Colour of areas outside the field of view, as `#RRGGBB[AA]`.
    pub fov_color: String,
    pub mask_atlas_max_size: u32,
    /// Quads per CPU-side light batch before it is flushed.
    pub light_batch_quads: usize,
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            draw_lighting: true,
            draw_shadows: true,
            max_light_count: 2048,
            max_shadowcasting_lights: 128,
            max_occluder_count: 2048,
            light_resolution_scale: 0.5,
            soft_shadows: true,
            light_blur: true,
            light_blur_factor: 0.001,
            fov_color: "#000000".to_string(),
            mask_atlas_max_size: 8192,
            light_batch_quads: 256,
        }
    }
}

impl LightingConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| LightingError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parsed FOV colour, falling back to black.
    pub fn fov_color(&self) -> Color {
        Color::from_hex(&self.fov_color).unwrap_or_else(|| {
            log::warn!(
                "Invalid FOV color '{}', falling back to black",
                self.fov_color
            );
            Color::BLACK
        })
    }

    /// Which derived resources must be rebuilt when moving from `previous` to `self`.
    pub fn changes_from(&self, previous: &LightingConfig) -> ConfigChanges {
        ConfigChanges {
            light_capacity: self.max_light_count != previous.max_light_count
                || self.max_shadowcasting_lights != previous.max_shadowcasting_lights
                || self.light_batch_quads != previous.light_batch_quads,
            occluder_capacity: self.max_occluder_count != previous.max_occluder_count,
            render_targets: self.light_resolution_scale != previous.light_resolution_scale
                || self.soft_shadows != previous.soft_shadows
                || self.max_shadowcasting_lights != previous.max_shadowcasting_lights,
        }
    }
}

/// Resources invalidated by a configuration change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    pub light_capacity: bool,
    pub occluder_capacity: bool,
    pub render_targets: bool,
}

impl ConfigChanges {
    pub fn any(&self) -> bool {
        self.light_capacity || self.occluder_capacity || self.render_targets
    }
}

/// Clamped capacities derived from a [`LightingConfig`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightLimits {
    pub max_lights: usize,
    pub max_shadow_lights: usize,
    pub max_occluders: usize,
    pub light_resolution_scale: f32,
    pub light_batch_quads: usize,
}

impl LightLimits {
    pub fn from_config(config: &LightingConfig) -> Self {
        let max_lights = config.max_light_count.max(1);

        let mut max_shadow_lights = config.max_shadowcasting_lights.min(max_lights);
        if max_shadow_lights > MAX_HARD_SHADOW_LIGHTS {
            log::warn!(
                "max_shadowcasting_lights {} exceeds the stencil limit, clamping to {}",
                max_shadow_lights,
                MAX_HARD_SHADOW_LIGHTS
            );
            max_shadow_lights = MAX_HARD_SHADOW_LIGHTS;
        }

        let max_occluders = config.max_occluder_count.clamp(MIN_OCCLUDERS, MAX_OCCLUDERS);
        if max_occluders != config.max_occluder_count {
            log::warn!(
                "max_occluder_count {} clamped to {}",
                config.max_occluder_count,
                max_occluders
            );
        }

        let light_resolution_scale = if config.light_resolution_scale < MIN_LIGHT_RESOLUTION_SCALE
        {
            log::warn!(
                "light_resolution_scale {} below minimum, using {}",
                config.light_resolution_scale,
                MIN_LIGHT_RESOLUTION_SCALE
            );
            MIN_LIGHT_RESOLUTION_SCALE
        } else {
            config.light_resolution_scale
        };

        Self {
            max_lights,
            max_shadow_lights,
            max_occluders,
            light_resolution_scale,
            light_batch_quads: config.light_batch_quads.max(1),
        }
    }

    /// Rows in the shadow atlas. Always at least one so the texture exists.
    pub fn shadow_atlas_rows(&self) -> u32 {
        self.max_shadow_lights.max(1) as u32
    }
}

impl Default for LightLimits {
    fn default() -> Self {
        Self::from_config(&LightingConfig::default())
    }
}

/// A config file watched for changes by modification time.
pub struct ConfigFile {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the config if the file changed since the last successful poll.
    pub fn poll(&mut self) -> Result<Option<LightingConfig>> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .map_err(|source| LightingError::ConfigRead {
                path: self.path.clone(),
                source,
            })?;

        if self.last_modified == Some(modified) {
            return Ok(None);
        }

        let config = LightingConfig::load(&self.path)?;
        self.last_modified = Some(modified);
        log::info!("Loaded lighting config from {}", self.path.display());
        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = LightingConfig::from_json_str(r#"{ "max_light_count": 16 }"#).unwrap();
        assert_eq!(config.max_light_count, 16);
        assert_eq!(config.max_shadowcasting_lights, 128);
        assert!(config.soft_shadows);
    }

    #[test]
    fn test_limits_clamp_shadow_capacity() {
        let config = LightingConfig {
            max_light_count: 16,
            max_shadowcasting_lights: 64,
            ..Default::default()
        };
        assert_eq!(LightLimits::from_config(&config).max_shadow_lights, 16);

        let config = LightingConfig {
            max_light_count: 4096,
            max_shadowcasting_lights: 1000,
            ..Default::default()
        };
        assert_eq!(
            LightLimits::from_config(&config).max_shadow_lights,
            MAX_HARD_SHADOW_LIGHTS
        );
    }

    #[test]
    fn test_limits_clamp_occluders_and_scale() {
        let config = LightingConfig {
            max_occluder_count: 10,
            light_resolution_scale: 0.0,
            ..Default::default()
        };
        let limits = LightLimits::from_config(&config);
        assert_eq!(limits.max_occluders, MIN_OCCLUDERS);
        assert_eq!(limits.light_resolution_scale, MIN_LIGHT_RESOLUTION_SCALE);
    }

    #[test]
    fn test_changes_detect_capacity_edits() {
        let old = LightingConfig::default();
        let new = LightingConfig {
            max_occluder_count: 4096,
            ..old.clone()
        };
        let changes = new.changes_from(&old);
        assert!(changes.occluder_capacity);
        assert!(!changes.light_capacity);
        assert!(!old.changes_from(&old).any());
    }

    #[test]
    fn test_bad_fov_color_falls_back_to_black() {
        let config = LightingConfig {
            fov_color: "nope".into(),
            ..Default::default()
        };
        assert_eq!(config.fov_color(), Color::BLACK);
    }

    #[test]
    fn test_config_file_poll_reports_changes_once() {
        let path = std::env::temp_dir().join(format!("lumen2d-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "soft_shadows": false }"#).unwrap();

        let mut file = ConfigFile::new(&path);
        let config = file.poll().unwrap().unwrap();
        assert!(!config.soft_shadows);
        assert!(file.poll().unwrap().is_none());

        std::fs::remove_file(&path).unwrap();
    }
}
