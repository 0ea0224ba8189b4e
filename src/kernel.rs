use enumset::{EnumSet, EnumSetType};
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::Write,
    sync::{Arc, Mutex},
};
use wgpu::{util::DeviceExt, BindGroupLayout, PipelineCompilationOptions};

use crate::{
    array::DType,
    device::{lock, Device},
    error::{ArrayError, Result},
    expr::WGSL_PRELUDE,
    operation::Operator,
};

#[derive(EnumSetType, Debug)]
pub(crate) enum EnabledBuiltins {
    GlobalId,
    LocalId,
    LocalIndex,
    WorkgroupId,
    NumWorkgroups,
}

/// WGSL for a compute kernel with the binding convention every kernel here shares:
/// binding 0 holds the `u32` launch parameters, then the read-only `f32` inputs,
/// then the single writable output.
pub(crate) struct GenericKernel {
    name: &'static str,
    workgroup_size: [u32; 3],
    inputs: u32,
    constants: Vec<(String, u32)>,
    workgroup_arrays: Vec<(String, String)>,
    enabled_builtins: EnumSet<EnabledBuiltins>,
    body: String,
}

impl GenericKernel {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            workgroup_size: [1, 1, 1],
            inputs: 0,
            constants: Vec::new(),
            workgroup_arrays: Vec::new(),
            enabled_builtins: EnumSet::new(),
            body: String::new(),
        }
    }

    pub(crate) fn set_workgroup_size(&mut self, workgroup_size: [u32; 3]) {
        self.workgroup_size = workgroup_size;
    }

    pub(crate) fn set_body(&mut self, body: String) {
        self.body = body;
    }

    /// Declare the next read-only input and return its WGSL name.
    pub(crate) fn add_input(&mut self) -> String {
        let name = format!("in_{}", self.inputs);
        self.inputs += 1;
        name
    }

    /// Bake a `u32` into the source. Changes the cache key.
    pub(crate) fn add_constant(&mut self, name: impl ToString, value: u32) -> String {
        let name = name.to_string();
        self.constants.push((name.clone(), value));
        name
    }

    pub(crate) fn add_workgroup_array(&mut self, name: impl ToString, ty: impl ToString) -> String {
        let name = name.to_string();
        self.workgroup_arrays.push((name.clone(), ty.to_string()));
        name
    }

    pub(crate) fn global_id(&mut self) -> String {
        self.enabled_builtins |= EnabledBuiltins::GlobalId;
        "global_id".to_string()
    }

    pub(crate) fn local_id(&mut self) -> String {
        self.enabled_builtins |= EnabledBuiltins::LocalId;
        "local_id".to_string()
    }

    pub(crate) fn local_index(&mut self) -> String {
        self.enabled_builtins |= EnabledBuiltins::LocalIndex;
        "local_index".to_string()
    }

    /// Linear index of the work-group across a grid folded by [`dispatch_size`].
    pub(crate) fn workgroup_index(&mut self) -> String {
        self.enabled_builtins |= EnabledBuiltins::WorkgroupId | EnabledBuiltins::NumWorkgroups;
        "(workgroup_id.x + workgroup_id.y * num_workgroups.x)".to_string()
    }

    pub(crate) fn source(&self) -> String {
        let mut kernel = String::new();
        // Writing into a String cannot fail.
        _ = self.kernel(&mut kernel);
        kernel
    }

    fn kernel(&self, f: &mut String) -> std::fmt::Result {
        writeln!(f, "// {}", self.name)?;
        f.push_str(WGSL_PRELUDE);
        writeln!(
            f,
            "@group(0) @binding(0) var<storage, read> params: array<u32>;"
        )?;
        let element = DType::F32.wgsl_type();
        for i in 0..self.inputs {
            writeln!(
                f,
                "@group(0) @binding({}) var<storage, read> in_{i}: array<{element}>;",
                i + 1
            )?;
        }
        writeln!(
            f,
            "@group(0) @binding({}) var<storage, read_write> output: array<{element}>;",
            self.inputs + 1
        )?;
        for (name, value) in &self.constants {
            writeln!(f, "const {name}: u32 = {value}u;")?;
        }
        for (name, ty) in &self.workgroup_arrays {
            writeln!(f, "var<workgroup> {name}: {ty};")?;
        }

        let [workgroup_size_x, workgroup_size_y, workgroup_size_z] = self.workgroup_size;
        writeln!(
            f,
            "@compute @workgroup_size({workgroup_size_x}, {workgroup_size_y}, {workgroup_size_z})"
        )?;
        let mut built_ins = Vec::new();
        for builtin in self.enabled_builtins {
            built_ins.push(match builtin {
                EnabledBuiltins::GlobalId => "@builtin(global_invocation_id) global_id: vec3<u32>",
                EnabledBuiltins::LocalId => "@builtin(local_invocation_id) local_id: vec3<u32>",
                EnabledBuiltins::LocalIndex => "@builtin(local_invocation_index) local_index: u32",
                EnabledBuiltins::WorkgroupId => "@builtin(workgroup_id) workgroup_id: vec3<u32>",
                EnabledBuiltins::NumWorkgroups => {
                    "@builtin(num_workgroups) num_workgroups: vec3<u32>"
                }
            });
        }
        writeln!(f, "fn main({}) {{", built_ins.join(", "))?;
        writeln!(f, "{}", self.body)?;
        writeln!(f, "}}")?;
        Ok(())
    }

    /// Compile (or fetch from the cache) and enqueue one launch.
    pub(crate) fn run(
        &self,
        device: &Device,
        operator: Operator,
        inputs: &[&wgpu::Buffer],
        output: &wgpu::Buffer,
        params: &[u32],
        workgroup_dispatch_size: [u32; 3],
    ) -> Result<()> {
        debug_assert_eq!(inputs.len(), self.inputs as usize);
        let source = self.source();
        let compiled = device
            .kernels()
            .get_or_compile(device, self.name, &source, self.inputs)?;

        let params = if params.is_empty() { &[0][..] } else { params };
        let params = device
            .wgpu_device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: bytemuck::cast_slice(params),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params.as_entire_binding(),
        }];
        for (i, input) in inputs.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: input.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: self.inputs + 1,
            resource: output.as_entire_binding(),
        });
        let bind_group = device
            .wgpu_device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout: &compiled.bind_group_layout,
                entries: &entries,
            });

        let mut encoder = device
            .wgpu_device()
            .create_command_encoder(&Default::default());
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.name),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&compiled.pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            let [workgroup_size_x, workgroup_size_y, workgroup_size_z] = workgroup_dispatch_size;
            cpass.dispatch_workgroups(workgroup_size_x, workgroup_size_y, workgroup_size_z);
        }
        device.wgpu_queue().submit(Some(encoder.finish()));
        device.record_launch(operator);
        log::trace!(
            "launched {} ({operator}) with {workgroup_dispatch_size:?} work-groups",
            self.name
        );
        Ok(())
    }
}

/// Fold `groups` work-groups into an `[x, y, 1]` grid within the per-dimension limit.
pub(crate) fn dispatch_size(device: &Device, groups: u32) -> Result<[u32; 3]> {
    let max = device.limits().max_compute_workgroups_per_dimension;
    if groups <= max {
        return Ok([groups.max(1), 1, 1]);
    }
    let y = groups.div_ceil(max);
    if y > max {
        return Err(ArrayError::unsupported(format!(
            "{groups} work-groups exceed the device launch limits"
        )));
    }
    Ok([max, y, 1])
}

pub(crate) struct CompiledKernel {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: BindGroupLayout,
}

/// Compiled kernels keyed by kernel name and exact source.
#[derive(Default)]
pub(crate) struct KernelCache {
    kernels: Mutex<HashMap<(&'static str, String), Arc<CompiledKernel>>>,
}

impl KernelCache {
    fn get_or_compile(
        &self,
        device: &Device,
        name: &'static str,
        source: &str,
        inputs: u32,
    ) -> Result<Arc<CompiledKernel>> {
        let mut kernels = lock(&self.kernels);
        if let Some(compiled) = kernels.get(&(name, source.to_string())) {
            device.record_compile(true);
            return Ok(compiled.clone());
        }
        log::debug!("compiling kernel {name}");
        log::trace!("{source}");
        let compiled = Arc::new(compile(device, name, source, inputs)?);
        device.record_compile(false);
        kernels.insert((name, source.to_string()), compiled.clone());
        Ok(compiled)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.kernels).len()
    }
}

fn bind_group_layout(device: &Device, inputs: u32) -> BindGroupLayout {
    let storage = |binding, read_only| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    let mut entries = vec![storage(0, true)];
    for i in 0..inputs {
        entries.push(storage(i + 1, true));
    }
    entries.push(storage(inputs + 1, false));

    device
        .wgpu_device()
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: None,
            entries: &entries,
        })
}

fn compile(
    device: &Device,
    name: &'static str,
    source: &str,
    inputs: u32,
) -> Result<CompiledKernel> {
    let wgpu_device = device.wgpu_device();
    wgpu_device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = wgpu_device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(name),
        source: wgpu::ShaderSource::Wgsl(Cow::Owned(source.to_string())),
    });
    let bind_group_layout = bind_group_layout(device, inputs);
    let compute_pipeline_layout =
        wgpu_device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: None,
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
    let pipeline = wgpu_device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(name),
        layout: Some(&compute_pipeline_layout),
        module: &module,
        entry_point: Some("main"),
        cache: None,
        compilation_options: PipelineCompilationOptions::default(),
    });
    if let Some(err) = futures::executor::block_on(wgpu_device.pop_error_scope()) {
        return Err(ArrayError::Compile {
            kernel: name.to_string(),
            message: err.to_string(),
        });
    }
    Ok(CompiledKernel {
        pipeline,
        bind_group_layout,
    })
}
