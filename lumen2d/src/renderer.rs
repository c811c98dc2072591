//! Per-frame orchestration of the lighting pipeline.

use std::path::Path;

use image::RgbaImage;

use crate::camera::{Eye, Viewport};
use crate::color::Color;
use crate::config::{LightLimits, LightingConfig};
use crate::error::Result;
use crate::render::backend::{BufferCapacities, LightingBackend, TargetSizes};
use crate::render::compose::{compose_lights, Composition, LightBatch};
use crate::render::depth::{fov_instances, DepthDriver, DepthInstance, DepthPasses};
use crate::render::fov::apply_fov;
use crate::render::light::PointLight;
use crate::render::mask_atlas::{load_mask_image, LightMaskAtlas, LightMaskPrototype};
use crate::render::occlusion::OcclusionGeometry;
use crate::render::post::{run_post, PostSettings};
use crate::render::selection::{select_lights, LightQuery};
use crate::spatial::{MapId, SpatialIndex};
use crate::stats::FrameStats;

/// Lighting settings of the map being viewed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapLighting {
    pub lighting_enabled: bool,
    /// Colour of unlit areas.
    pub ambient: Color,
}

impl Default for MapLighting {
    fn default() -> Self {
        Self {
            lighting_enabled: true,
            ambient: Color::BLACK,
        }
    }
}

/// Scratch buffers reused from frame to frame.
pub struct RenderContext {
    pub lights: Vec<PointLight>,
    pub light_instances: Vec<DepthInstance>,
    pub geometry: OcclusionGeometry,
    pub batch: LightBatch,
}

impl RenderContext {
    fn new(limits: &LightLimits) -> Self {
        Self {
            lights: Vec::with_capacity(limits.max_lights),
            light_instances: Vec::with_capacity(limits.max_shadow_lights),
            geometry: OcclusionGeometry::new(limits.max_occluders),
            batch: LightBatch::new(limits.light_batch_quads),
        }
    }
}

/// Draws lighting, shadows and FOV for one eye per frame through a
/// [`LightingBackend`].
pub struct LightingRenderer<B: LightingBackend> {
    backend: B,
    config: LightingConfig,
    limits: LightLimits,
    fov_color: Color,
    context: RenderContext,
    masks: LightMaskAtlas,
    depth: DepthDriver,
    stats: FrameStats,
    target_sizes: Option<TargetSizes>,
}

impl<B: LightingBackend> LightingRenderer<B> {
    /// Creates a renderer with no light masks loaded.
    pub fn new(mut backend: B, config: LightingConfig) -> Result<Self> {
        let limits = LightLimits::from_config(&config);
        let masks = LightMaskAtlas::empty();

        backend.resize_buffers(&BufferCapacities::new(&limits))?;
        backend.upload_mask_atlas(masks.image())?;

        log::info!(
            "Lighting renderer ready: {} lights, {} shadow rows, {} occluders",
            limits.max_lights,
            limits.max_shadow_lights,
            limits.max_occluders
        );

        Ok(Self {
            backend,
            fov_color: config.fov_color(),
            config,
            context: RenderContext::new(&limits),
            limits,
            masks,
            depth: DepthDriver::new(),
            stats: FrameStats::default(),
            target_sizes: None,
        })
    }

    /// Merges the prototypes' mask textures into the atlas and uploads it.
    ///
    /// On error the previous atlas stays in use.
    pub fn load_masks<F>(&mut self, prototypes: &[LightMaskPrototype], loader: F) -> Result<()>
    where
        F: FnMut(&Path) -> anyhow::Result<RgbaImage>,
    {
        let max_size = self
            .backend
            .capabilities()
            .max_texture_size
            .min(self.config.mask_atlas_max_size);
        let masks = LightMaskAtlas::build(prototypes, loader, max_size)?;
        self.backend.upload_mask_atlas(masks.image())?;
        log::info!(
            "Loaded light mask atlas {}x{}",
            masks.image().width(),
            masks.image().height()
        );
        self.masks = masks;
        Ok(())
    }

    /// [`load_masks`](Self::load_masks) reading each texture from disk.
    pub fn load_masks_from_disk(&mut self, prototypes: &[LightMaskPrototype]) -> Result<()> {
        self.load_masks(prototypes, load_mask_image)
    }

    /// Swaps in a new configuration, rebuilding only what it invalidates.
    pub fn apply_config(&mut self, config: LightingConfig) -> Result<()> {
        let changes = config.changes_from(&self.config);
        if config.fov_color != self.config.fov_color {
            self.fov_color = config.fov_color();
        }
        self.config = config;
        self.limits = LightLimits::from_config(&self.config);

        if !changes.any() {
            return Ok(());
        }
        log::info!("Applying lighting config change: {:?}", changes);

        if changes.light_capacity {
            self.context.batch.resize(self.limits.light_batch_quads);
            reserve_total(&mut self.context.lights, self.limits.max_lights);
            reserve_total(&mut self.context.light_instances, self.limits.max_shadow_lights);
        }
        if changes.occluder_capacity {
            self.context.geometry.resize(self.limits.max_occluders);
        }
        if changes.light_capacity || changes.occluder_capacity {
            self.backend
                .resize_buffers(&BufferCapacities::new(&self.limits))?;
        }
        if changes.render_targets {
            self.target_sizes = None;
        }
        Ok(())
    }

    /// Renders one frame for `eye` and returns its counters.
    pub fn render_frame<S: SpatialIndex>(
        &mut self,
        index: &S,
        eye: &Eye,
        viewport: &Viewport,
        map_lighting: &MapLighting,
    ) -> Result<&FrameStats> {
        self.stats.reset();

        if !self.config.enabled
            || !eye.draw_light
            || eye.map == MapId::NULLSPACE
            || !map_lighting.lighting_enabled
        {
            return Ok(&self.stats);
        }

        let sizes = TargetSizes::new(viewport, &self.limits);
        if self.target_sizes != Some(sizes) {
            log::debug!("Resizing light targets to {:?}", sizes);
            self.backend.resize_targets(&sizes)?;
            self.target_sizes = Some(sizes);
        }

        self.backend.begin_frame()?;

        let world_bounds = viewport.world_bounds(eye);
        let query = LightQuery {
            eye,
            world_bounds,
            world_aabb: world_bounds.calc_bounding_box(),
            limits: &self.limits,
            shadows_enabled: self.config.draw_shadows,
        };
        let selection = select_lights(
            index,
            &query,
            &self.masks,
            &mut self.context.lights,
            &mut self.context.light_instances,
            &mut self.stats,
        );

        self.context
            .geometry
            .build(index, eye, selection.expanded_bounds, &mut self.stats);
        self.backend.upload_occlusion(
            &self.context.geometry,
            &self.context.light_instances,
            &fov_instances(),
        )?;

        self.depth.run(
            &mut self.backend,
            &self.context.geometry,
            DepthPasses {
                shadow_instances: selection.shadow_count as u32,
                draw_shadows: self.config.draw_shadows,
                draw_fov: eye.draw_fov,
            },
            &mut self.stats,
        )?;

        if self.config.draw_lighting {
            let composition = Composition {
                eye,
                viewport,
                ambient: map_lighting.ambient,
                target_size: sizes.light_map,
                soft_shadows: self.config.soft_shadows,
                occluder_count: self.context.geometry.occluder_count(),
                shadow_atlas_rows: self.limits.shadow_atlas_rows(),
            };
            compose_lights(
                &mut self.backend,
                &composition,
                &self.context.lights,
                &mut self.context.batch,
                &mut self.stats,
            )?;

            run_post(
                &mut self.backend,
                &PostSettings {
                    light_blur: self.config.light_blur,
                    light_blur_factor: self.config.light_blur_factor,
                    camera_size: viewport.camera_size(eye),
                },
                &mut self.stats,
            )?;
        }

        if eye.draw_fov {
            apply_fov(
                &mut self.backend,
                viewport,
                eye,
                self.fov_color,
                &mut self.stats,
            )?;
        }

        self.backend.end_frame()?;
        Ok(&self.stats)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &LightingConfig {
        &self.config
    }

    pub fn limits(&self) -> &LightLimits {
        &self.limits
    }

    pub fn masks(&self) -> &LightMaskAtlas {
        &self.masks
    }

    /// Counters of the last rendered frame.
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Lights drawn in the last frame, eye-relative.
    pub fn lights(&self) -> &[PointLight] {
        &self.context.lights
    }
}

/// Grows `vec` so it holds `total` elements without reallocating.
fn reserve_total<T>(vec: &mut Vec<T>, total: usize) {
    vec.reserve(total.saturating_sub(vec.len()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::light::LightComponent;
    use crate::math::{Transform2D, Vec2};
    use crate::render::recorder::{GpuCommand, RecordingBackend};
    use crate::spatial::SpatialWorld;
    use anyhow::anyhow;

    const MAP: MapId = MapId(1);

    fn recording_renderer(config: LightingConfig) -> LightingRenderer<RecordingBackend> {
        let mut renderer = LightingRenderer::new(RecordingBackend::new(), config).unwrap();
        renderer.backend_mut().take_commands();
        renderer
    }

    fn world_with_light(light: LightComponent) -> SpatialWorld {
        let mut world = SpatialWorld::new();
        let tree = world.add_tree(MAP, Transform2D::identity());
        world.spawn_light(tree, Transform2D::identity(), light);
        world
    }

    #[test]
    fn test_setup_uploads_buffers_and_white_atlas() {
        let renderer =
            LightingRenderer::new(RecordingBackend::new(), LightingConfig::default()).unwrap();
        assert_eq!(
            renderer.backend().commands()[1],
            GpuCommand::UploadMaskAtlas {
                width: 1,
                height: 1
            }
        );
        assert!(matches!(
            renderer.backend().commands()[0],
            GpuCommand::ResizeBuffers(_)
        ));
    }

    #[test]
    fn test_early_outs_issue_no_commands() {
        let world = world_with_light(LightComponent::new(5.0, Color::WHITE));
        let viewport = Viewport::new(640, 480);
        let mut renderer = recording_renderer(LightingConfig::default());

        let cases = [
            (Eye::new(Vec2::ZERO, MAP).with_lighting(false), MapLighting::default()),
            (Eye::new(Vec2::ZERO, MapId::NULLSPACE), MapLighting::default()),
            (
                Eye::new(Vec2::ZERO, MAP),
                MapLighting {
                    lighting_enabled: false,
                    ..MapLighting::default()
                },
            ),
        ];
        for (eye, lighting) in cases {
            let stats = *renderer.render_frame(&world, &eye, &viewport, &lighting).unwrap();
            assert_eq!(stats, FrameStats::default());
        }
        assert!(renderer.backend().commands().is_empty());

        let mut disabled = recording_renderer(LightingConfig {
            enabled: false,
            ..LightingConfig::default()
        });
        let eye = Eye::new(Vec2::ZERO, MAP);
        disabled
            .render_frame(&world, &eye, &viewport, &MapLighting::default())
            .unwrap();
        assert!(disabled.backend().commands().is_empty());
    }

    #[test]
    fn test_frame_stage_order() {
        let world = world_with_light(LightComponent::new(5.0, Color::WHITE).with_shadows(false));
        let eye = Eye::new(Vec2::ZERO, MAP);
        let viewport = Viewport::new(640, 480);
        let mut renderer = recording_renderer(LightingConfig::default());

        renderer
            .render_frame(&world, &eye, &viewport, &MapLighting::default())
            .unwrap();
        let commands = renderer.backend_mut().take_commands();

        let position = |predicate: fn(&GpuCommand) -> bool| {
            commands.iter().position(predicate).unwrap()
        };
        let resize = position(|c| matches!(c, GpuCommand::ResizeTargets(_)));
        let upload = position(|c| matches!(c, GpuCommand::UploadOcclusion { .. }));
        let depth = position(|c| matches!(c, GpuCommand::SetDepthState(_)));
        let light = position(|c| matches!(c, GpuCommand::BeginLightPass(_)));
        let merge = position(|c| matches!(c, GpuCommand::MergeWallBleed));
        let fov = position(|c| matches!(c, GpuCommand::ApplyFov(_)));
        assert!(resize < upload && upload < depth && depth < light && light < merge && merge < fov);
        assert_eq!(commands.last(), Some(&GpuCommand::EndFrame));
        assert_eq!(renderer.stats().total_lights, 1);
    }

    #[test]
    fn test_targets_resize_only_on_change() {
        let world = SpatialWorld::new();
        let eye = Eye::new(Vec2::ZERO, MAP);
        let mut renderer = recording_renderer(LightingConfig::default());
        let lighting = MapLighting::default();
        let resizes = |r: &LightingRenderer<RecordingBackend>| {
            r.backend()
                .count(|c| matches!(c, GpuCommand::ResizeTargets(_)))
        };

        renderer.render_frame(&world, &eye, &Viewport::new(640, 480), &lighting).unwrap();
        renderer.render_frame(&world, &eye, &Viewport::new(640, 480), &lighting).unwrap();
        assert_eq!(resizes(&renderer), 1);

        renderer.render_frame(&world, &eye, &Viewport::new(800, 600), &lighting).unwrap();
        assert_eq!(resizes(&renderer), 2);
    }

    #[test]
    fn test_config_change_resizes_what_it_touches() {
        let mut renderer = recording_renderer(LightingConfig::default());

        renderer
            .apply_config(LightingConfig {
                light_blur: false,
                ..LightingConfig::default()
            })
            .unwrap();
        assert!(renderer.backend().commands().is_empty());

        renderer
            .apply_config(LightingConfig {
                max_occluder_count: 4096,
                ..LightingConfig::default()
            })
            .unwrap();
        assert_eq!(renderer.limits().max_occluders, 4096);
        assert!(matches!(
            renderer.backend().commands(),
            [GpuCommand::ResizeBuffers(capacities)] if capacities.max_occluders == 4096
        ));
    }

    #[test]
    fn test_raised_light_capacity_is_reserved_up_front() {
        let mut renderer = recording_renderer(LightingConfig {
            max_light_count: 16,
            max_shadowcasting_lights: 4,
            ..LightingConfig::default()
        });
        renderer
            .apply_config(LightingConfig {
                max_light_count: 512,
                max_shadowcasting_lights: 64,
                ..LightingConfig::default()
            })
            .unwrap();

        assert!(renderer.context.lights.capacity() >= renderer.limits().max_lights);
        assert!(
            renderer.context.light_instances.capacity() >= renderer.limits().max_shadow_lights
        );
        assert_eq!(renderer.limits().max_lights, 512);
    }

    #[test]
    fn test_fov_colour_is_parsed_once_per_config() {
        let world = SpatialWorld::new();
        let eye = Eye::new(Vec2::ZERO, MAP);
        let viewport = Viewport::new(320, 240);
        let fov_colors = |r: &mut LightingRenderer<RecordingBackend>| {
            r.backend_mut()
                .take_commands()
                .into_iter()
                .filter_map(|c| match c {
                    GpuCommand::ApplyFov(blit) => Some(blit.occlude_color),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };

        let mut renderer = recording_renderer(LightingConfig {
            fov_color: "not a colour".into(),
            ..LightingConfig::default()
        });
        assert_eq!(renderer.fov_color, Color::BLACK);
        for _ in 0..2 {
            renderer
                .render_frame(&world, &eye, &viewport, &MapLighting::default())
                .unwrap();
        }
        assert_eq!(fov_colors(&mut renderer), vec![Color::BLACK; 2]);

        renderer
            .apply_config(LightingConfig {
                fov_color: "#ff0000".into(),
                ..LightingConfig::default()
            })
            .unwrap();
        renderer
            .render_frame(&world, &eye, &viewport, &MapLighting::default())
            .unwrap();
        assert_eq!(fov_colors(&mut renderer), vec![Color::rgb(1.0, 0.0, 0.0)]);
    }

    #[test]
    fn test_lighting_off_skips_composition() {
        let world = world_with_light(LightComponent::new(5.0, Color::WHITE));
        let eye = Eye::new(Vec2::ZERO, MAP).with_fov(false);
        let mut renderer = recording_renderer(LightingConfig {
            draw_lighting: false,
            ..LightingConfig::default()
        });
        renderer
            .render_frame(&world, &eye, &Viewport::new(320, 240), &MapLighting::default())
            .unwrap();
        assert_eq!(
            renderer
                .backend()
                .count(|c| matches!(c, GpuCommand::BeginLightPass(_) | GpuCommand::ApplyFov(_))),
            0
        );
    }

    #[test]
    fn test_failed_mask_load_keeps_white_fallback() {
        let mut renderer = recording_renderer(LightingConfig::default());
        let prototypes = [LightMaskPrototype::new("cone", "cone.png")];
        renderer
            .load_masks(&prototypes, |_| Err(anyhow!("missing file")))
            .unwrap();
        assert_eq!(renderer.masks().uv_box(Some("cone")), renderer.masks().white_box());
    }

    #[test]
    fn test_masks_load_from_png_files() {
        let path = std::env::temp_dir().join(format!("lumen2d-mask-{}.png", std::process::id()));
        RgbaImage::from_pixel(4, 2, image::Rgba([255, 0, 0, 255]))
            .save(&path)
            .unwrap();

        let mut renderer = recording_renderer(LightingConfig::default());
        let prototypes = [
            LightMaskPrototype::new("cone", &path),
            LightMaskPrototype::new("missing", path.with_extension("gone.png")),
        ];
        renderer.load_masks_from_disk(&prototypes).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(renderer.masks().image().dimensions(), (5, 2));
        assert_ne!(renderer.masks().uv_box(Some("cone")), renderer.masks().white_box());
        assert_eq!(renderer.masks().uv_box(Some("missing")), renderer.masks().white_box());
        assert!(matches!(
            renderer.backend().commands(),
            [GpuCommand::UploadMaskAtlas { width: 5, height: 2 }]
        ));
    }
}
