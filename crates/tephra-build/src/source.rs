//! Texture Source
//!
//! Source pixel data for one logical texture: one or more blocks (UDIM /
//! atlas tiles of the logical image), each with one image per layer.

use tephra_cache::ContentHash;
use tephra_core::RawImage;

use crate::error::{BuildResult, ValidationError};

/// One source block: a UDIM/atlas tile of the logical image
#[derive(Debug, Clone)]
pub struct SourceBlock {
    /// Block coordinate within the logical image grid
    pub block_x: u32,
    pub block_y: u32,
    /// One image per layer; every block carries the same layer count
    pub layers: Vec<RawImage>,
}

/// Source pixels for one logical texture
#[derive(Debug, Clone)]
pub struct TextureSource {
    pub name: String,
    pub blocks: Vec<SourceBlock>,
}

impl TextureSource {
    /// Single-block, single-layer source
    pub fn new_2d(name: impl Into<String>, image: RawImage) -> Self {
        Self {
            name: name.into(),
            blocks: vec![SourceBlock {
                block_x: 0,
                block_y: 0,
                layers: vec![image],
            }],
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.first().map_or(0, |b| b.layers.len())
    }

    /// Dimensions of the largest block
    pub fn top_dimensions(&self) -> (u32, u32) {
        self.blocks.iter().fold((0, 0), |(w, h), block| {
            let image = &block.layers[0];
            (w.max(image.width()), h.max(image.height()))
        })
    }

    /// True when any block of the layer stores HDR (float) pixels
    pub fn is_hdr(&self, layer: usize) -> bool {
        self.blocks
            .iter()
            .any(|b| b.layers.get(layer).is_some_and(|i| i.format().is_hdr()))
    }

    /// Validate the block/layer structure
    pub fn validate(&self) -> BuildResult<()> {
        if self.blocks.is_empty() {
            return Err(ValidationError::EmptySource.into());
        }
        let layers = self.blocks[0].layers.len();
        for block in &self.blocks {
            if block.layers.len() != layers {
                return Err(ValidationError::LayerCountMismatch {
                    settings: layers,
                    source_layers: block.layers.len(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Content identifier: a hash over every block's coordinates, shape
    /// and pixel bytes. Identical pixels produce identical ids.
    pub fn content_id(&self) -> ContentHash {
        let mut hasher = blake3::Hasher::new();
        for block in &self.blocks {
            hasher.update(&block.block_x.to_le_bytes());
            hasher.update(&block.block_y.to_le_bytes());
            for layer in &block.layers {
                let info = layer.info();
                hasher.update(&info.width.to_le_bytes());
                hasher.update(&info.height.to_le_bytes());
                hasher.update(&info.num_slices.to_le_bytes());
                hasher.update(info.format.name().as_bytes());
                hasher.update(layer.data());
            }
        }
        ContentHash::from_bytes(*hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tephra_core::{GammaSpace, ImageInfo, RawFormat};

    fn image(width: u32, height: u32) -> RawImage {
        RawImage::new_black(ImageInfo::new_2d(
            width,
            height,
            RawFormat::Bgra8,
            GammaSpace::Srgb,
        ))
    }

    #[test]
    fn test_content_id_tracks_pixels() {
        let a = TextureSource::new_2d("a", image(4, 4));
        let b = TextureSource::new_2d("b", image(4, 4));
        // Name is identity metadata, not content
        assert_eq!(a.content_id(), b.content_id());

        let mut changed = image(4, 4);
        changed.write_texel(0, 0, 0, [1.0, 0.0, 0.0, 1.0]);
        let c = TextureSource::new_2d("c", changed);
        assert_ne!(a.content_id(), c.content_id());

        let d = TextureSource::new_2d("d", image(8, 4));
        assert_ne!(a.content_id(), d.content_id());
    }

    #[test]
    fn test_validate_layer_counts() {
        let mut source = TextureSource::new_2d("t", image(4, 4));
        source.blocks.push(SourceBlock {
            block_x: 1,
            block_y: 0,
            layers: vec![image(4, 4), image(4, 4)],
        });
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_top_dimensions() {
        let mut source = TextureSource::new_2d("t", image(64, 32));
        source.blocks.push(SourceBlock {
            block_x: 1,
            block_y: 0,
            layers: vec![image(128, 64)],
        });
        assert_eq!(source.top_dimensions(), (128, 64));
    }
}
