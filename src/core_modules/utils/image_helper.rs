pub mod image_helper {
    use image::{ExtendedColorType, ImageEncoder, Rgba, RgbaImage};

    use crate::core_modules::feature_map::Heatmap;

    /// Renders each heatmap cell as a `scale x scale` block. Red and alpha grow with
    /// intensity; green and blue stay zero so the overlay tints whatever is beneath.
    pub fn render(heatmap: &Heatmap, scale: u32) -> RgbaImage {
        let scale = scale.max(1);
        let width = heatmap.cols() as u32 * scale;
        let height = heatmap.rows() as u32 * scale;
        RgbaImage::from_fn(width, height, |x, y| {
            let value = heatmap.get((y / scale) as usize, (x / scale) as usize);
            let intensity = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
            Rgba([intensity, 0, 0, intensity])
        })
    }

    pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, image::error::ImageError> {
        let mut bytes = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut bytes);
        encoder.write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgba8)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {

    use super::image_helper::*;
    use crate::core_modules::feature_map::Heatmap;

    #[test]
    fn render_scales_cells_into_blocks() {
        let heatmap = Heatmap::new(1, 2, vec![1.0, 0.5]).unwrap();
        let image = render(&heatmap, 3);
        assert_eq!(image.dimensions(), (6, 3));
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(image.get_pixel(2, 2).0, [255, 0, 0, 255]);
        assert_eq!(image.get_pixel(3, 0).0, [128, 0, 0, 128]);
        assert_eq!(image.get_pixel(5, 2).0, [128, 0, 0, 128]);
    }

    #[test]
    fn cold_heatmap_renders_transparent() {
        let image = render(&Heatmap::zeros(2, 2), 1);
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0, 0]));
    }

    #[test]
    fn encoded_png_decodes_back() {
        let heatmap = Heatmap::new(2, 2, vec![0.0, 0.25, 0.75, 1.0]).unwrap();
        let image = render(&heatmap, 4);
        let bytes = encode_png(&image).expect("Error encoding PNG.");
        assert_eq!(&bytes[1..4], b"PNG");
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded, image);
    }
}
