use std::sync::Arc;

use image::{Rgba, RgbaImage};

use super::error::ChunkError;
use crate::geometry::{Point, Rect};

pub type Color = Rgba<u8>;

pub const TRANSPARENT: Color = Rgba([0, 0, 0, 0]);

pub fn opaque(r: u8, g: u8, b: u8) -> Color {
    Rgba([r, g, b, 255])
}

/// Ordered color table of a paletted canvas. Holds between 1 and 256 colors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<Color>,
}

impl Palette {
    pub fn new(colors: Vec<Color>) -> Option<Self> {
        if colors.is_empty() || colors.len() > 256 {
            return None;
        }
        Some(Self { colors })
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn get(&self, index: u8) -> Option<Color> {
        self.colors.get(index as usize).copied()
    }

    pub fn colors(&self) -> &[Color] {
        &self.colors
    }

    /// Index of the closest palette entry by squared RGBA distance.
    /// Ties resolve to the lowest index.
    pub fn nearest_index(&self, color: Color) -> u8 {
        let mut best_index = 0usize;
        let mut best_distance = u32::MAX;
        for (index, candidate) in self.colors.iter().enumerate() {
            let distance = candidate
                .0
                .iter()
                .zip(color.0.iter())
                .map(|(a, b)| {
                    let diff = *a as i32 - *b as i32;
                    (diff * diff) as u32
                })
                .sum::<u32>();
            if distance < best_distance {
                best_distance = distance;
                best_index = index;
                if distance == 0 {
                    break;
                }
            }
        }
        best_index as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    Paletted {
        palette: Arc<Palette>,
        indices: Vec<u8>,
    },
    Rgba(RgbaImage),
}

/// Image buffer placed in world space.
///
/// Paletted images store one index byte per pixel, direct-color images use an
/// [`RgbaImage`]. Either way the buffer covers exactly `rect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasImage {
    rect: Rect,
    data: PixelData,
}

impl CanvasImage {
    /// Fully transparent direct-color image.
    pub fn new_rgba(rect: Rect) -> Self {
        let (width, height) = dimensions(&rect);
        Self {
            rect,
            data: PixelData::Rgba(RgbaImage::from_pixel(width, height, TRANSPARENT)),
        }
    }

    /// Paletted image filled with palette index 0.
    pub fn new_paletted(rect: Rect, palette: Arc<Palette>) -> Self {
        let (width, height) = dimensions(&rect);
        Self {
            rect,
            data: PixelData::Paletted {
                palette,
                indices: vec![0; width as usize * height as usize],
            },
        }
    }

    pub fn blank(rect: Rect, palette: Option<&Arc<Palette>>) -> Self {
        match palette {
            Some(palette) => Self::new_paletted(rect, Arc::clone(palette)),
            None => Self::new_rgba(rect),
        }
    }

    /// Places an existing buffer with its top-left corner at `origin`.
    pub fn from_rgba(origin: Point, image: RgbaImage) -> Self {
        let rect = Rect::from_origin_size(origin.x, origin.y, image.width() as i32, image.height() as i32);
        Self {
            rect,
            data: PixelData::Rgba(image),
        }
    }

    /// Builds an opaque image from tightly packed RGB triples.
    pub fn from_rgb_bytes(origin: Point, width: u32, height: u32, rgb: &[u8]) -> Option<Self> {
        if rgb.len() != width as usize * height as usize * 3 {
            return None;
        }
        let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
        for triple in rgb.chunks_exact(3) {
            rgba.extend_from_slice(&[triple[0], triple[1], triple[2], 255]);
        }
        let image = RgbaImage::from_raw(width, height, rgba)?;
        Some(Self::from_rgba(origin, image))
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn data(&self) -> &PixelData {
        &self.data
    }

    pub fn palette(&self) -> Option<&Arc<Palette>> {
        match &self.data {
            PixelData::Paletted { palette, .. } => Some(palette),
            PixelData::Rgba(_) => None,
        }
    }

    pub fn pixel(&self, pos: Point) -> Result<Color, ChunkError> {
        let (x, y) = self.local(pos)?;
        Ok(self.color_at_local(x, y))
    }

    pub fn index_at(&self, pos: Point) -> Result<u8, ChunkError> {
        let (x, y) = self.local(pos)?;
        match &self.data {
            PixelData::Paletted { indices, .. } => Ok(indices[self.linear(x, y)]),
            PixelData::Rgba(_) => Err(ChunkError::NotPaletted),
        }
    }

    /// Writes a color and returns the color actually stored. Paletted images
    /// store the nearest palette entry.
    pub fn set_pixel(&mut self, pos: Point, color: Color) -> Result<Color, ChunkError> {
        let (x, y) = self.local(pos)?;
        Ok(self.put_local(x, y, color))
    }

    pub fn set_index(&mut self, pos: Point, index: u8) -> Result<(), ChunkError> {
        let (x, y) = self.local(pos)?;
        let linear = self.linear(x, y);
        match &mut self.data {
            PixelData::Paletted { palette, indices } => {
                if index as usize >= palette.len() {
                    return Err(ChunkError::PaletteIndex {
                        index,
                        len: palette.len(),
                    });
                }
                indices[linear] = index;
                Ok(())
            }
            PixelData::Rgba(_) => Err(ChunkError::NotPaletted),
        }
    }

    /// Copy of the part of this image inside `rect`, keeping the pixel format.
    pub fn copy_region(&self, rect: Rect) -> CanvasImage {
        let region = self.rect.intersect(&rect);
        let mut copy = match &self.data {
            PixelData::Paletted { palette, .. } => CanvasImage::new_paletted(region, Arc::clone(palette)),
            PixelData::Rgba(_) => CanvasImage::new_rgba(region),
        };
        copy.copy_from(self);
        copy
    }

    /// Overwrites the overlapping area with the pixels of `src`.
    pub fn copy_from(&mut self, src: &CanvasImage) {
        let overlap = self.rect.intersect(&src.rect);
        if overlap.is_empty() {
            return;
        }
        let same_palette = match (&self.data, &src.data) {
            (PixelData::Paletted { palette: a, .. }, PixelData::Paletted { palette: b, .. }) => {
                Arc::ptr_eq(a, b) || a == b
            }
            _ => false,
        };

        for y in overlap.min.y..overlap.max.y {
            for x in overlap.min.x..overlap.max.x {
                let (sx, sy) = (
                    (x - src.rect.min.x) as u32,
                    (y - src.rect.min.y) as u32,
                );
                let (dx, dy) = (
                    (x - self.rect.min.x) as u32,
                    (y - self.rect.min.y) as u32,
                );
                if same_palette {
                    let src_linear = src.linear(sx, sy);
                    let dst_linear = self.linear(dx, dy);
                    if let (
                        PixelData::Paletted { indices: dst, .. },
                        PixelData::Paletted { indices: from, .. },
                    ) = (&mut self.data, &src.data)
                    {
                        dst[dst_linear] = from[src_linear];
                    }
                    continue;
                }
                self.put_local(dx, dy, src.color_at_local(sx, sy));
            }
        }
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        match &self.data {
            PixelData::Rgba(image) => image.clone(),
            PixelData::Paletted { palette, indices } => {
                let (width, height) = dimensions(&self.rect);
                let mut image = RgbaImage::new(width, height);
                for (pixel, index) in image.pixels_mut().zip(indices.iter()) {
                    *pixel = palette.get(*index).unwrap_or(TRANSPARENT);
                }
                image
            }
        }
    }

    /// Tightly packed RGB triples, row-major. Alpha is dropped.
    pub fn to_rgb_bytes(&self) -> Vec<u8> {
        let image = self.to_rgba_image();
        let mut rgb = Vec::with_capacity(image.width() as usize * image.height() as usize * 3);
        for pixel in image.pixels() {
            rgb.extend_from_slice(&pixel.0[..3]);
        }
        rgb
    }

    /// `x` and `y` must lie inside the image.
    fn color_at_local(&self, x: u32, y: u32) -> Color {
        match &self.data {
            PixelData::Paletted { palette, indices } => {
                let index = indices[self.linear(x, y)];
                palette.get(index).unwrap_or(TRANSPARENT)
            }
            PixelData::Rgba(image) => *image.get_pixel(x, y),
        }
    }

    /// `x` and `y` must lie inside the image.
    fn put_local(&mut self, x: u32, y: u32, color: Color) -> Color {
        let linear = self.linear(x, y);
        match &mut self.data {
            PixelData::Paletted { palette, indices } => {
                let index = palette.nearest_index(color);
                indices[linear] = index;
                palette.get(index).unwrap_or(TRANSPARENT)
            }
            PixelData::Rgba(image) => {
                image.put_pixel(x, y, color);
                color
            }
        }
    }

    fn local(&self, pos: Point) -> Result<(u32, u32), ChunkError> {
        if !self.rect.contains_point(pos) {
            return Err(ChunkError::OutOfBounds {
                pos,
                rect: self.rect,
            });
        }
        Ok((
            (pos.x as i64 - self.rect.min.x as i64) as u32,
            (pos.y as i64 - self.rect.min.y as i64) as u32,
        ))
    }

    fn linear(&self, x: u32, y: u32) -> usize {
        y as usize * self.rect.width().max(0) as usize + x as usize
    }
}

fn dimensions(rect: &Rect) -> (u32, u32) {
    (rect.width().max(0) as u32, rect.height().max(0) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_color_palette() -> Arc<Palette> {
        Arc::new(Palette::new(vec![opaque(255, 255, 255), opaque(229, 0, 0)]).expect("palette"))
    }

    #[test]
    fn palette_picks_nearest_color() {
        let palette = two_color_palette();
        assert_eq!(palette.nearest_index(opaque(250, 10, 10)), 1);
        assert_eq!(palette.nearest_index(opaque(240, 240, 240)), 0);
        assert!(Palette::new(Vec::new()).is_none());
    }

    #[test]
    fn paletted_pixels_roundtrip_through_index() {
        let mut image = CanvasImage::new_paletted(Rect::new(-4, -4, 4, 4), two_color_palette());
        image.set_index(Point::new(-4, 3), 1).expect("set index");
        assert_eq!(image.index_at(Point::new(-4, 3)).expect("index"), 1);
        assert_eq!(image.pixel(Point::new(-4, 3)).expect("pixel"), opaque(229, 0, 0));
        assert_eq!(
            image.set_index(Point::new(0, 0), 9),
            Err(ChunkError::PaletteIndex { index: 9, len: 2 })
        );
        assert!(matches!(
            image.index_at(Point::new(4, 0)),
            Err(ChunkError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn paletted_set_pixel_reports_stored_color() {
        let mut image = CanvasImage::new_paletted(Rect::new(0, 0, 2, 2), two_color_palette());
        let stored = image.set_pixel(Point::new(1, 1), opaque(250, 10, 10)).expect("set");
        assert_eq!(stored, opaque(229, 0, 0));
        assert_eq!(image.pixel(Point::new(1, 1)).expect("get"), stored);
    }

    #[test]
    fn rgba_image_rejects_index_access() {
        let mut image = CanvasImage::new_rgba(Rect::new(0, 0, 2, 2));
        assert_eq!(image.index_at(Point::new(0, 0)), Err(ChunkError::NotPaletted));
        assert_eq!(image.set_index(Point::new(0, 0), 0), Err(ChunkError::NotPaletted));
        image.set_pixel(Point::new(1, 1), opaque(1, 2, 3)).expect("set");
        assert_eq!(image.pixel(Point::new(1, 1)).expect("get"), opaque(1, 2, 3));
        assert_eq!(image.pixel(Point::new(0, 0)).expect("get"), TRANSPARENT);
    }

    #[test]
    fn copy_region_keeps_world_position() {
        let mut image = CanvasImage::new_rgba(Rect::new(0, 0, 8, 8));
        image.set_pixel(Point::new(5, 6), opaque(9, 9, 9)).expect("set");
        let region = image.copy_region(Rect::new(4, 4, 100, 100));
        assert_eq!(region.rect(), Rect::new(4, 4, 8, 8));
        assert_eq!(region.pixel(Point::new(5, 6)).expect("get"), opaque(9, 9, 9));
    }

    #[test]
    fn copy_from_converts_between_formats() {
        let palette = two_color_palette();
        let mut paletted = CanvasImage::new_paletted(Rect::new(0, 0, 2, 1), Arc::clone(&palette));
        paletted.set_index(Point::new(1, 0), 1).expect("set");

        let mut rgba = CanvasImage::new_rgba(Rect::new(0, 0, 3, 1));
        rgba.copy_from(&paletted);
        assert_eq!(rgba.pixel(Point::new(0, 0)).expect("get"), opaque(255, 255, 255));
        assert_eq!(rgba.pixel(Point::new(1, 0)).expect("get"), opaque(229, 0, 0));
        assert_eq!(rgba.pixel(Point::new(2, 0)).expect("get"), TRANSPARENT);

        let mut back = CanvasImage::new_paletted(Rect::new(0, 0, 2, 1), palette);
        back.copy_from(&rgba);
        assert_eq!(back, paletted);
    }

    #[test]
    fn rgb_bytes_roundtrip() {
        let mut image = CanvasImage::new_rgba(Rect::new(10, 20, 12, 21));
        image.set_pixel(Point::new(10, 20), opaque(1, 2, 3)).expect("set");
        image.set_pixel(Point::new(11, 20), opaque(4, 5, 6)).expect("set");
        let rgb = image.to_rgb_bytes();
        assert_eq!(rgb, vec![1, 2, 3, 4, 5, 6]);
        let decoded = CanvasImage::from_rgb_bytes(Point::new(10, 20), 2, 1, &rgb).expect("decode");
        assert_eq!(decoded, image);
        assert!(CanvasImage::from_rgb_bytes(Point::new(0, 0), 2, 2, &rgb).is_none());
    }
}
