//! Merges light mask textures into a single atlas.
//!
//! Pixel (0,0) is always opaque white so that lights without a mask can
//! sample the same atlas through a one-pixel "white box".

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use image::{imageops, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{LightingError, Result};
use crate::math::Box2;

/// A light mask definition: an id and an optional texture on disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LightMaskPrototype {
    pub id: String,
    #[serde(default)]
    pub texture: Option<PathBuf>,
}

impl LightMaskPrototype {
    pub fn new(id: impl Into<String>, texture: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            texture: Some(texture.into()),
        }
    }
}

/// Loads a mask texture from disk as RGBA8.
pub fn load_mask_image(path: &Path) -> anyhow::Result<RgbaImage> {
    let image = image::open(path)
        .with_context(|| format!("Failed to load light mask {}", path.display()))?;
    Ok(image.to_rgba8())
}

/// The merged mask texture plus the UV box of every mask in it.
pub struct LightMaskAtlas {
    image: RgbaImage,
    boxes: HashMap<String, Box2>,
    white: Box2,
}

impl LightMaskAtlas {
    /// Builds the atlas.
    ///
    /// Masks that fail to load are logged and use the white box. Fails if
    /// the merged strip is wider than `max_size`.
    pub fn build<F>(prototypes: &[LightMaskPrototype], mut loader: F, max_size: u32) -> Result<Self>
    where
        F: FnMut(&Path) -> anyhow::Result<RgbaImage>,
    {
        let mut loaded = Vec::with_capacity(prototypes.len());
        for prototype in prototypes {
            let Some(path) = prototype.texture.as_deref() else {
                continue;
            };
            match loader(path) {
                Ok(image) => loaded.push((prototype.id.as_str(), image)),
                Err(err) => log::error!(
                    "Light mask '{}' could not be loaded, using an unmasked light: {:#}",
                    prototype.id,
                    err
                ),
            }
        }

        let width = loaded.iter().map(|(_, image)| image.width()).sum::<u32>() + 1;
        let height = loaded
            .iter()
            .map(|(_, image)| image.height())
            .max()
            .unwrap_or(1)
            .max(1);

        if width > max_size {
            return Err(LightingError::MaskAtlasTooWide {
                width,
                max: max_size,
            });
        }

        let mut atlas = RgbaImage::new(width, height);
        atlas.put_pixel(0, 0, Rgba([255, 255, 255, 255]));

        let (w, h) = (width as f32, height as f32);
        let uv_box = |left: u32, top: u32, right: u32, bottom: u32| {
            Box2::new(
                left as f32 / w,
                (h - bottom as f32) / h,
                right as f32 / w,
                (h - top as f32) / h,
            )
        };

        let mut boxes = HashMap::with_capacity(loaded.len());
        let mut x = 1;
        for (id, image) in &loaded {
            imageops::replace(&mut atlas, image, i64::from(x), 0);
            boxes.insert(
                (*id).to_string(),
                uv_box(x, 0, x + image.width(), image.height()),
            );
            x += image.width();
        }

        log::info!(
            "Built light mask atlas {}x{} with {} masks",
            width,
            height,
            boxes.len()
        );

        Ok(Self {
            image: atlas,
            boxes,
            white: uv_box(0, 0, 1, 1),
        })
    }

    /// An atlas holding only the white pixel.
    pub fn empty() -> Self {
        Self {
            image: RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 255])),
            boxes: HashMap::new(),
            white: Box2::new(0.0, 0.0, 1.0, 1.0),
        }
    }

    /// UV box for a mask id. No mask, or an unknown one, maps to the white box.
    pub fn uv_box(&self, mask: Option<&str>) -> Box2 {
        mask.and_then(|id| self.boxes.get(id))
            .copied()
            .unwrap_or(self.white)
    }

    pub fn white_box(&self) -> Box2 {
        self.white
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }
}

impl Default for LightMaskAtlas {
    fn default() -> Self {
        Self::empty()
    }
}
