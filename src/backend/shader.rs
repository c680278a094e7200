// Shader module loading
//
// Vulkan consumes SPIR-V. build.rs compiles the GLSL sources with glslc;
// the resulting .spv files are read at startup.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use super::VulkanDevice;

/// Decode SPIR-V bytes into aligned words, checking the magic number
pub fn decode_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let mut cursor = std::io::Cursor::new(bytes);
    ash::util::read_spv(&mut cursor).context("Invalid SPIR-V")
}

/// Load a compiled shader from disk and create a shader module
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {:?}. Was it compiled with glslc?", path))?;
    let code = decode_spirv(&bytes).with_context(|| format!("Failed to load shader {:?}", path))?;

    let create_info = vk::ShaderModuleCreateInfo::builder()
        .code(&code);

    unsafe {
        device.device.create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian_words() {
        let magic = 0x0723_0203u32.to_le_bytes();
        let version = 0x0001_0000u32.to_le_bytes();
        let bytes: Vec<u8> = magic.iter().chain(version.iter()).copied().collect();

        let words = decode_spirv(&bytes).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(decode_spirv(&[0x03, 0x02, 0x23]).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        assert!(decode_spirv(&[0, 0, 0, 0]).is_err());
    }
}
