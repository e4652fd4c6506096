//! Shader template processing for the culling program.

use std::collections::{HashMap, HashSet};

use handlebars::{Context, Handlebars, Helper, HelperDef, Output, RenderContext, RenderError};
use parking_lot::Mutex;
use rust_embed::RustEmbed;
use serde::Serialize;

use super::{
    CullingShaderKey, CULLED_INSTANCE_INDICES_BINDING, CULL_DATA_BINDING, CULL_INPUT_BINDING, CULL_WORKGROUP_SIZE,
    DRAW_COMMANDS_BINDING, INSTANCE_INDICES_BINDING, INSTANCE_TRANSFORMS_BINDING, PARAMS_BINDING,
    VISIBLE_COUNT_BINDING,
};

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/shaders"]
struct DrawBatchShaderSources;

/// Entry point of the culling program.
pub const CULL_ENTRY_POINT: &str = "cs_main";
const CULL_SHADER: &str = "drawbatch/cull.wgsl";

#[derive(Serialize)]
struct CullBindings {
    params: u32,
    cull_input: u32,
    draw_commands: u32,
    cull_data: u32,
    instance_indices: u32,
    culled_instance_indices: u32,
    visible_count: u32,
}

#[derive(Serialize)]
struct InstanceLevelConfig {
    level: u32,
    binding: u32,
    /// Word offset of this level's `instanceDC` in a draw command.
    dc_offset: u32,
    /// Word of this level inside an instance index tuple.
    index_slot: u32,
}

#[derive(Serialize)]
struct CullShaderConfig {
    #[serde(flatten)]
    key: CullingShaderKey,
    instance_index_width: u32,
    workgroup_size: u32,
    bindings: CullBindings,
    instance_levels: Vec<InstanceLevelConfig>,
}

impl CullShaderConfig {
    fn new(key: &CullingShaderKey) -> Self {
        Self {
            key: *key,
            instance_index_width: key.instance_index_width(),
            workgroup_size: CULL_WORKGROUP_SIZE,
            bindings: CullBindings {
                params: PARAMS_BINDING,
                cull_input: CULL_INPUT_BINDING,
                draw_commands: DRAW_COMMANDS_BINDING,
                cull_data: CULL_DATA_BINDING,
                instance_indices: INSTANCE_INDICES_BINDING,
                culled_instance_indices: CULLED_INSTANCE_INDICES_BINDING,
                visible_count: VISIBLE_COUNT_BINDING,
            },
            instance_levels: (0..key.instancer_num_levels)
                .map(|level| InstanceLevelConfig {
                    level,
                    binding: INSTANCE_TRANSFORMS_BINDING + level,
                    dc_offset: key.drawing_coord_i_offset + level,
                    index_slot: level + 1,
                })
                .collect(),
        }
    }
}

pub struct ShaderPreProcessor {
    files: HashMap<String, String>,
}

impl ShaderPreProcessor {
    pub fn new() -> Self {
        let mut v = Self { files: HashMap::new() };
        v.add_shaders_embed::<DrawBatchShaderSources>("drawbatch");
        v
    }

    pub fn add_shaders_embed<T: RustEmbed>(&mut self, prefix: &str) {
        for file in T::iter() {
            let Some(embedded) = T::get(&file) else {
                continue;
            };
            match String::from_utf8(embedded.data.into_owned()) {
                Ok(contents) => {
                    self.files.insert(format!("{prefix}/{file}"), contents);
                }
                Err(e) => log::error!("Embedded shader {file} is not utf-8: {e}"),
            }
        }
    }

    pub fn add_shader(&mut self, name: &str, contents: &str) {
        self.files.insert(name.to_owned(), contents.to_owned());
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        self.files.get(name)
    }

    pub fn render_shader<T>(&self, base: &str, config: &T) -> Result<String, RenderError>
    where
        T: Serialize,
    {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.set_dev_mode(cfg!(debug_assertions));
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("include", Box::new(ShaderIncluder::new(base, &self.files)));
        let contents = self.files.get(base).ok_or_else(|| {
            RenderError::new(format!(
                "Base shader {base} is not registered. All registered shaders: {}",
                registered_shader_string(&self.files)
            ))
        })?;

        registry.render_template(contents, config)
    }

    /// Source of the culling program specialized for `key`.
    pub fn render_culling_shader(&self, key: &CullingShaderKey) -> Result<String, RenderError> {
        self.render_shader(CULL_SHADER, &CullShaderConfig::new(key))
    }
}

impl Default for ShaderPreProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn registered_shader_string(files: &HashMap<String, String>) -> String {
    let mut v: Vec<_> = files.keys().cloned().collect();
    v.sort_unstable();
    v.join(", ")
}

struct ShaderIncluder<'a> {
    files: &'a HashMap<String, String>,
    include_state: Mutex<HashSet<String>>,
}
impl<'a> ShaderIncluder<'a> {
    fn new(base: &str, files: &'a HashMap<String, String>) -> Self {
        Self {
            files,
            include_state: Mutex::new({
                let mut set = HashSet::new();
                set.insert(base.to_owned());
                set
            }),
        }
    }
}
impl<'a> HelperDef for ShaderIncluder<'a> {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> handlebars::HelperResult {
        let file_name_value = h
            .param(0)
            .ok_or_else(|| RenderError::new("include helper must have a single argument for the include path"))?
            .value();
        let file_name = match file_name_value {
            handlebars::JsonValue::String(s) => s,
            _ => return Err(RenderError::new("include helper's first argument must be a string")),
        };

        // each file is pasted at most once
        if !self.include_state.lock().insert(file_name.clone()) {
            return Ok(());
        }

        let contents = self.files.get(file_name).ok_or_else(|| {
            RenderError::new(format!(
                "Included file \"{file_name}\" is not registered. All registered files: {}",
                registered_shader_string(self.files)
            ))
        })?;

        out.write(&r.render_template(contents, ctx.data())?)?;

        Ok(())
    }
}
