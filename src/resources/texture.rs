//! Texture data and upload

use crate::backend::*;
use image::{DynamicImage, GenericImageView};

/// CPU side texture, RGBA8
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Decode an encoded image (PNG, JPEG, ...) from memory
    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self, image::ImageError> {
        let img = image::load_from_memory(bytes)?;
        Ok(Self::from_image(img, name))
    }

    fn from_image(img: DynamicImage, name: &str) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            format: TextureFormat::Rgba8UnormSrgb,
            data: img.to_rgba8().into_raw(),
            name: name.to_string(),
        }
    }

    /// Create a solid color texture
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8UnormSrgb,
            data: color.to_vec(),
            name: name.to_string(),
        }
    }

    pub fn white() -> Self {
        Self::solid_color([255, 255, 255, 255], "white")
    }

    /// Create a checkerboard texture with 8 pixel squares
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);

        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                let color = if is_even { color1 } else { color2 };
                data.extend_from_slice(&color);
            }
        }

        Self {
            width: size,
            height: size,
            format: TextureFormat::Rgba8UnormSrgb,
            data,
            name: "checkerboard".to_string(),
        }
    }
}

/// Uploaded texture with its view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuTexture {
    pub handle: TextureHandle,
    pub view: TextureViewHandle,
    pub width: u32,
    pub height: u32,
}

impl GpuTexture {
    /// Create and upload texture to GPU
    pub fn create(backend: &mut dyn GraphicsBackend, data: &TextureData) -> BackendResult<Self> {
        let handle = backend.create_texture(&TextureDescriptor {
            label: Some(data.name.clone()),
            width: data.width,
            height: data.height,
            format: data.format,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        })?;

        let view = match backend.create_texture_view(handle) {
            Ok(view) => view,
            Err(e) => {
                backend.destroy_texture(handle);
                return Err(e);
            }
        };
        backend.write_texture(handle, &data.data, data.width, data.height);

        Ok(Self {
            handle,
            view,
            width: data.width,
            height: data.height,
        })
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_texture_view(self.view);
        backend.destroy_texture(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_every_eight_pixels() {
        let black = [0, 0, 0, 255];
        let white = [255, 255, 255, 255];
        let texture = TextureData::checkerboard(16, white, black);
        assert_eq!(texture.data.len(), 16 * 16 * 4);

        let pixel = |x: usize, y: usize| &texture.data[(y * 16 + x) * 4..(y * 16 + x) * 4 + 4];
        assert_eq!(pixel(0, 0), white);
        assert_eq!(pixel(8, 0), black);
        assert_eq!(pixel(8, 8), white);
    }

    #[test]
    fn decodes_png_from_memory() {
        let mut png = Vec::new();
        let img = image::RgbaImage::from_pixel(2, 3, image::Rgba([10, 20, 30, 255]));
        DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageOutputFormat::Png)
            .unwrap();

        let texture = TextureData::from_bytes(&png, "tiny").unwrap();
        assert_eq!((texture.width, texture.height), (2, 3));
        assert_eq!(&texture.data[..4], &[10, 20, 30, 255]);
        assert!(TextureData::from_bytes(b"not an image", "junk").is_err());
    }

    #[test]
    fn upload_creates_texture_and_view() {
        let mut backend = HeadlessBackend::new(8, 8);
        let gpu = GpuTexture::create(&mut backend, &TextureData::white()).unwrap();
        assert!(backend.texture_by_label("white").is_some());
        gpu.destroy(&mut backend);
        assert_eq!(backend.live_object_count(), 0);
    }
}
