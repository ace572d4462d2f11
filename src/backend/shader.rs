// Shader module loading
//
// Vulkan uses SPIR-V bytecode for shaders. The bytes are decoded into
// aligned 32-bit words before the module is created, so callers may hand
// over any byte slice (an asset blob, a file read, an FFI array).

use ash::vk;
use std::io::Cursor;
use std::sync::Arc;

use super::device::Device;
use super::error::{GpuError, GpuResult};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A compiled shader module tagged with the stage it runs in.
pub struct Shader {
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    device: Arc<Device>,
}

impl Shader {
    pub fn new(device: Arc<Device>, code: &[u8], stage: vk::ShaderStageFlags) -> GpuResult<Self> {
        let words = decode_spirv(code)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .map_err(GpuError::vk("create shader module"))?;

        log::info!("Shader ready ({:?}, {} words)", stage, words.len());
        Ok(Self {
            module,
            stage,
            device,
        })
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Decode SPIR-V bytes into words, fixing endianness when needed.
pub fn decode_spirv(code: &[u8]) -> GpuResult<Vec<u32>> {
    if code.is_empty() {
        return Err(GpuError::MalformedShader("empty byte code".to_string()));
    }

    let words = ash::util::read_spv(&mut Cursor::new(code))
        .map_err(|e| GpuError::MalformedShader(e.to_string()))?;

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(other) => Err(GpuError::MalformedShader(format!(
            "bad magic number {:#010x}",
            other
        ))),
        None => Err(GpuError::MalformedShader("empty byte code".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(magic: u32) -> Vec<u8> {
        let mut bytes = magic.to_le_bytes().to_vec();
        // version 1.0, generator, bound, schema
        for word in [0x0001_0000u32, 0, 1, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn decodes_little_endian_words() {
        let words = decode_spirv(&header(SPIRV_MAGIC)).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
    }

    #[test]
    fn rejects_empty_code() {
        assert!(matches!(decode_spirv(&[]), Err(GpuError::MalformedShader(_))));
    }

    #[test]
    fn rejects_unaligned_length() {
        let mut bytes = header(SPIRV_MAGIC);
        bytes.push(0);
        assert!(matches!(decode_spirv(&bytes), Err(GpuError::MalformedShader(_))));
    }

    #[test]
    fn rejects_wrong_magic() {
        let err = decode_spirv(&header(0xdead_beef)).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }
}
