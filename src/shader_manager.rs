// Shader loading and variant management
//
// Shader sources resolve to templates (one per stage+path), templates
// to variants (one per preprocessor define set). Compiled SPIR-V is
// exported next to a .shadermeta archive listing every file the
// compile touched; a variant whose dependencies have newer mtimes
// than its exported SPIR-V recompiles transparently.

use serde::{Deserialize, Serialize};

use crate::cache::{HashCombiner, VulkanCache};
use crate::device::Device;
use crate::shader::{Shader, ShaderStage};
use crate::{CandelaError, Result};

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::SystemTime;

const EXPORT_SHADER_PATH: &str = ".export/shaders/";
const SOURCE_SHADER_PATH: &str = "shaders/";

/// The dependency list persisted beside each exported SPIR-V file.
#[derive(Serialize, Deserialize)]
struct ShaderDependencyArchive {
    /// dependency paths are stored relative to this directory
    source_dir: String,
    dependencies: Vec<String>,
}

/// One compiled define-permutation of a shader template.
pub(crate) struct ShaderVariant {
    pub spirv: Vec<u8>,
    pub spirv_hash: u64,
}

/// One (stage, source path) pair and its compiled variants.
pub(crate) struct ShaderTemplate {
    stage: ShaderStage,
    path: String,
    variants: VulkanCache<ShaderVariant>,
}

fn shaderc_kind(stage: ShaderStage) -> shaderc::ShaderKind {
    match stage {
        ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
        ShaderStage::TessControl => shaderc::ShaderKind::TessControl,
        ShaderStage::TessEval => shaderc::ShaderKind::TessEvaluation,
        ShaderStage::Geometry => shaderc::ShaderKind::Geometry,
        ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
        ShaderStage::Compute => shaderc::ShaderKind::Compute,
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn meta_path(export_path: &Path) -> PathBuf {
    let mut path = export_path.as_os_str().to_owned();
    path.push(".shadermeta");
    PathBuf::from(path)
}

/// True when the exported SPIR-V is older than any of its recorded
/// dependencies.
fn is_shader_outdated(export_path: &Path) -> bool {
    let spirv_time = match modified_time(export_path) {
        Some(time) => time,
        // no exported binary yet
        None => return true,
    };

    let meta = meta_path(export_path);
    let bytes = match fs::read(&meta) {
        Ok(bytes) => bytes,
        // no metadata means no tracked dependencies, e.g. a
        // packaged build; treat as current
        Err(_) => return false,
    };

    let archive: ShaderDependencyArchive = match bincode::deserialize(&bytes) {
        Ok(archive) => archive,
        Err(_) => return true,
    };

    let root = PathBuf::from(&archive.source_dir);
    for dep in archive.dependencies.iter() {
        if let Some(dep_time) = modified_time(&root.join(dep)) {
            if spirv_time < dep_time {
                return true;
            }
        }
    }

    false
}

fn save_shader_and_metadata(
    export_path: &Path,
    spirv: &[u8],
    source_dir: &str,
    dependencies: &[String],
) -> Result<()> {
    if let Some(parent) = export_path.parent() {
        fs::create_dir_all(parent).or(Err(CandelaError::INVALID))?;
    }
    fs::write(export_path, spirv).or(Err(CandelaError::INVALID))?;

    let archive = ShaderDependencyArchive {
        source_dir: source_dir.to_string(),
        dependencies: dependencies.to_vec(),
    };
    let bytes = bincode::serialize(&archive).or(Err(CandelaError::INVALID))?;
    fs::write(meta_path(export_path), bytes).or(Err(CandelaError::INVALID))?;
    Ok(())
}

impl ShaderTemplate {
    fn new(stage: ShaderStage, path: String) -> Self {
        Self {
            stage,
            path,
            variants: VulkanCache::new(),
        }
    }

    fn defines_hash(defines: &[String]) -> u64 {
        let mut hasher = HashCombiner::new();
        for define in defines.iter() {
            hasher.data(define.as_bytes());
            hasher.u8(0);
        }
        hasher.get()
    }

    fn export_path(&self, defines_hash: u64) -> PathBuf {
        PathBuf::from(format!(
            "{}{}.{:016x}.spv",
            EXPORT_SHADER_PATH, self.path, defines_hash
        ))
    }

    /// Compile the template's source with the given defines,
    /// tracking every include as a dependency.
    fn compile(&self, defines: &[String]) -> Result<(Vec<u8>, Vec<String>)> {
        let source_path = PathBuf::from(SOURCE_SHADER_PATH).join(&self.path);
        let source = fs::read_to_string(&source_path).map_err(|e| {
            log::error!("Could not read shader source {:?}: {}", source_path, e);
            CandelaError::SHADER_COMPILE_FAILED
        })?;

        let compiler =
            shaderc::Compiler::new().ok_or(CandelaError::SHADER_COMPILE_FAILED)?;
        let mut options =
            shaderc::CompileOptions::new().ok_or(CandelaError::SHADER_COMPILE_FAILED)?;
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_2 as u32,
        );

        for define in defines.iter() {
            match define.split_once('=') {
                Some((name, value)) => options.add_macro_definition(name, Some(value)),
                None => options.add_macro_definition(define, None),
            }
        }

        // every resolved include becomes a staleness dependency
        let dependencies: Rc<RefCell<Vec<String>>> =
            Rc::new(RefCell::new(vec![self.path.clone()]));
        let deps = dependencies.clone();
        options.set_include_callback(move |name, _ty, _src, _depth| {
            let full = PathBuf::from(SOURCE_SHADER_PATH).join(name);
            let content = fs::read_to_string(&full)
                .map_err(|e| format!("could not open include {}: {}", name, e))?;
            deps.borrow_mut().push(name.to_string());
            Ok(shaderc::ResolvedInclude {
                resolved_name: full.to_string_lossy().into_owned(),
                content,
            })
        });

        let artifact = compiler
            .compile_into_spirv(
                &source,
                shaderc_kind(self.stage),
                &self.path,
                "main",
                Some(&options),
            )
            .map_err(|e| {
                log::error!("Failed to compile shader {}: {}", self.path, e);
                CandelaError::SHADER_COMPILE_FAILED
            })?;

        let spirv = artifact.as_binary_u8().to_vec();
        let deps = dependencies.borrow().clone();
        Ok((spirv, deps))
    }

    /// Fetch the variant for a define set, compiling or reloading
    /// from the export cache as needed.
    fn register_variant(&self, defines: &[String]) -> Result<Arc<ShaderVariant>> {
        let hash = Self::defines_hash(defines);

        self.variants.try_get_or_insert_with(hash, || {
            let export_path = self.export_path(hash);

            let spirv = if is_shader_outdated(&export_path) {
                let (spirv, deps) = self.compile(defines)?;
                if let Err(e) =
                    save_shader_and_metadata(&export_path, &spirv, SOURCE_SHADER_PATH, &deps)
                {
                    log::warn!("Could not export compiled shader {}: {:?}", self.path, e);
                }
                spirv
            } else {
                fs::read(&export_path).or(Err(CandelaError::SHADER_COMPILE_FAILED))?
            };

            let mut hasher = HashCombiner::new();
            hasher.data(&spirv);
            Ok(ShaderVariant {
                spirv_hash: hasher.get(),
                spirv,
            })
        })
    }
}

/// Resolves shader paths to compiled, reflected Shader objects.
pub(crate) struct ShaderManager {
    templates: VulkanCache<ShaderTemplate>,
}

impl ShaderManager {
    pub fn new() -> Self {
        Self {
            templates: VulkanCache::new(),
        }
    }

    fn template_hash(stage: ShaderStage, path: &str) -> u64 {
        let mut hasher = HashCombiner::new();
        hasher.u32(stage as u32);
        hasher.data(path.as_bytes());
        hasher.get()
    }

    /// Resolve a shader from its source path and defines. Unchanged
    /// sources hit the export cache and hand back the same SPIR-V
    /// stream (and therefore the same Shader).
    pub fn load_shader(
        &self,
        device: &Arc<Device>,
        stage: ShaderStage,
        path: &str,
        defines: &[String],
    ) -> Result<Arc<Shader>> {
        let hash = Self::template_hash(stage, path);
        let template = self
            .templates
            .get_or_insert_with(hash, || ShaderTemplate::new(stage, path.to_string()));

        let variant = template.register_variant(defines)?;
        log::debug!(
            "Loaded shader {} (spirv {:016x})",
            path,
            variant.spirv_hash
        );
        device.request_shader(stage, &variant.spirv)
    }

    /// Promote the template and variant caches at a frame boundary.
    pub fn move_to_read_only(&self) {
        self.templates.move_to_read_only();
        self.templates
            .for_each(|template| template.variants.move_to_read_only());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_dir(tag: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("candela-shadermeta-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_export_is_outdated() {
        let dir = unique_dir("missing");
        assert!(is_shader_outdated(&dir.join("never-compiled.spv")));
    }

    #[test]
    fn export_without_metadata_is_current() {
        let dir = unique_dir("nometa");
        let export = dir.join("shader.spv");
        fs::write(&export, b"spirv").unwrap();
        assert!(!is_shader_outdated(&export));
    }

    #[test]
    fn newer_dependency_triggers_recompile() {
        let dir = unique_dir("stale");
        let export = dir.join("shader.spv");
        fs::write(&export, b"spirv").unwrap();

        // record a dependency and then touch it after the export
        let dep_name = "common.glsl".to_string();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let dep = dir.join(&dep_name);
        fs::write(&dep, b"// include").unwrap();

        save_shader_and_metadata(
            &export,
            b"spirv",
            dir.to_str().unwrap(),
            &[dep_name.clone()],
        )
        .unwrap();
        // rewriting the export bumped its mtime past the dep again,
        // so touch the dep once more
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&dep, b"// changed").unwrap();

        assert!(is_shader_outdated(&export));
    }

    #[test]
    fn defines_order_changes_variant_hash() {
        let a = ShaderTemplate::defines_hash(&["FOO=1".into(), "BAR".into()]);
        let b = ShaderTemplate::defines_hash(&["BAR".into(), "FOO=1".into()]);
        let c = ShaderTemplate::defines_hash(&["FOO=1".into(), "BAR".into()]);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
