use image::{Rgb, RgbImage};
use std::fs::{self, File};
use std::path::Path;
use std::time::SystemTime;

/// 64x48 diagonal gradient; different seeds shift the colours.
pub fn write_gradient_png(path: &Path, seed: u8) {
    let image = RgbImage::from_fn(64, 48, |x, y| {
        let value = ((x + y) * 2) as u8;
        Rgb([value.wrapping_add(seed), value, 255 - value])
    });
    image.save_with_format(path, image::ImageFormat::Png).unwrap();
}

/// 64x64 vertical black and white stripes.
pub fn write_stripes_png(path: &Path) {
    let image = RgbImage::from_fn(64, 64, |x, _| {
        if (x / 8) % 2 == 0 {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });
    image.save_with_format(path, image::ImageFormat::Png).unwrap();
}

pub fn set_mtime(path: &Path, modified: SystemTime) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
}

pub fn write_with_mtime(path: &Path, contents: &[u8], modified: SystemTime) {
    fs::write(path, contents).unwrap();
    set_mtime(path, modified);
}
