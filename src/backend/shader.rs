// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. Shaders are compiled ahead of time
// (see build.rs) and read from disk when the pipelines are built.

use ash::vk;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::VulkanDevice;

#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("could not read shader {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("shader {path:?} is empty")]
    Empty { path: PathBuf },

    #[error("shader {path:?} is not SPIR-V: {source}")]
    InvalidSpirv {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("device rejected shader {path:?}: {result}")]
    Rejected { path: PathBuf, result: vk::Result },
}

/// Read a SPIR-V file into 32-bit words.
///
/// Fails on a missing file, an empty file, or a byte length that is not a
/// whole number of words.
pub fn read_spirv(path: &Path) -> Result<Vec<u32>, ShaderError> {
    let bytes = std::fs::read(path).map_err(|source| ShaderError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    if bytes.is_empty() {
        return Err(ShaderError::Empty {
            path: path.to_path_buf(),
        });
    }

    // read_spv also realigns the bytes and fixes endianness from the magic
    ash::util::read_spv(&mut Cursor::new(&bytes)).map_err(|source| ShaderError::InvalidSpirv {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a SPIR-V file and create a shader module from it.
///
/// Failures are returned, not escalated: the caller decides whether a
/// missing shader is fatal.
pub fn load_shader_module(
    device: &VulkanDevice,
    path: &Path,
) -> Result<vk::ShaderModule, ShaderError> {
    let code = read_spirv(path)?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    let module = unsafe { device.device.create_shader_module(&create_info, None) }.map_err(
        |result| ShaderError::Rejected {
            path: path.to_path_buf(),
            result,
        },
    )?;

    log::info!("Loaded shader {:?}", path);
    Ok(module)
}
