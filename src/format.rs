// Pixel format metadata
//
// Formats cross the renderer boundary as DRM fourcc codes, the
// convention of the buffer producers we interoperate with. This table
// resolves a fourcc to the Vulkan format used for views, pipelines and
// readback, along with the properties the copy paths need.

use ash::vk;

const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24
}

pub const DRM_FORMAT_ARGB8888: u32 = fourcc(b'A', b'R', b'2', b'4');
pub const DRM_FORMAT_XRGB8888: u32 = fourcc(b'X', b'R', b'2', b'4');
pub const DRM_FORMAT_ABGR8888: u32 = fourcc(b'A', b'B', b'2', b'4');
pub const DRM_FORMAT_XBGR8888: u32 = fourcc(b'X', b'B', b'2', b'4');

/// One supported pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatEntry {
    /// The DRM fourcc code of this format
    pub drm_format: u32,
    /// The Vulkan equivalent. Draw targets and textures are imported
    /// as sRGB so sampling and blending happen in linear space.
    pub vk_format: vk::Format,
    /// Bits per pixel of the packed in-memory layout
    pub bpp: u32,
    /// False for the X variants, whose alpha channel is padding
    pub has_alpha: bool,
}

impl FormatEntry {
    pub fn bytes_per_pixel(&self) -> u32 {
        self.bpp / 8
    }
}

/// Every format the renderer knows about. All of these are 32-bit
/// single-plane formats; packed little-endian ARGB order corresponds
/// to BGRA byte order in memory.
pub static FORMATS: [FormatEntry; 4] = [
    FormatEntry {
        drm_format: DRM_FORMAT_ARGB8888,
        vk_format: vk::Format::B8G8R8A8_SRGB,
        bpp: 32,
        has_alpha: true,
    },
    FormatEntry {
        drm_format: DRM_FORMAT_XRGB8888,
        vk_format: vk::Format::B8G8R8A8_SRGB,
        bpp: 32,
        has_alpha: false,
    },
    FormatEntry {
        drm_format: DRM_FORMAT_ABGR8888,
        vk_format: vk::Format::R8G8B8A8_SRGB,
        bpp: 32,
        has_alpha: true,
    },
    FormatEntry {
        drm_format: DRM_FORMAT_XBGR8888,
        vk_format: vk::Format::R8G8B8A8_SRGB,
        bpp: 32,
        has_alpha: false,
    },
];

/// Look up the entry for a DRM fourcc code.
pub fn format_from_drm(drm_format: u32) -> Option<&'static FormatEntry> {
    FORMATS.iter().find(|f| f.drm_format == drm_format)
}

/// Render a fourcc as the four ascii characters producers log it as.
pub fn drm_format_name(drm_format: u32) -> String {
    drm_format
        .to_le_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_codes_match_drm() {
        // Values from drm_fourcc.h
        assert_eq!(DRM_FORMAT_ARGB8888, 0x34325241);
        assert_eq!(DRM_FORMAT_XRGB8888, 0x34325258);
    }

    #[test]
    fn lookup_known_and_unknown() {
        let argb = format_from_drm(DRM_FORMAT_ARGB8888).unwrap();
        assert_eq!(argb.vk_format, vk::Format::B8G8R8A8_SRGB);
        assert!(argb.has_alpha);
        assert_eq!(argb.bytes_per_pixel(), 4);

        let xbgr = format_from_drm(DRM_FORMAT_XBGR8888).unwrap();
        assert!(!xbgr.has_alpha);

        assert!(format_from_drm(fourcc(b'N', b'V', b'1', b'2')).is_none());
    }

    #[test]
    fn format_names() {
        assert_eq!(drm_format_name(DRM_FORMAT_ARGB8888), "AR24");
        assert_eq!(drm_format_name(DRM_FORMAT_XBGR8888), "XB24");
    }
}
