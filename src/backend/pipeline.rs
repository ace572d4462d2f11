// Compute pipeline creation and management
//
// A ComputePipeline owns everything needed to dispatch one shader:
// descriptor pool, set layouts, sets, pipeline layout, pipeline object,
// and the command pool its Commands are allocated from.
//
// Creation order:  pool -> set layouts -> sets -> pipeline layout -> pipeline -> command pool
// Teardown order:  the exact reverse

use ash::vk;
use std::sync::Arc;

use super::buffer::{Buffer, DescriptorKind};
use super::command::{Command, Workgroups};
use super::device::Device;
use super::error::{GpuError, GpuResult};
use super::shader::Shader;

const ENTRY_POINT: &std::ffi::CStr = c"main";

/// One slot in a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub binding: u32,
    pub kind: DescriptorKind,
}

impl Binding {
    pub fn new(binding: u32, kind: DescriptorKind) -> Self {
        Self { binding, kind }
    }

    pub fn storage(binding: u32) -> Self {
        Self::new(binding, DescriptorKind::Storage)
    }

    pub fn uniform(binding: u32) -> Self {
        Self::new(binding, DescriptorKind::Uniform)
    }
}

/// Bindings of one descriptor set, in declaration order.
pub type SetLayout = Vec<Binding>;

/// Descriptor pool create-info values for a list of set layouts.
#[derive(Debug, Clone)]
pub struct PoolPlan {
    /// Descriptor counts per kind across every binding of every set.
    /// Kinds that never occur are omitted: a pool size entry must be non-zero.
    pub sizes: Vec<vk::DescriptorPoolSize>,
    /// One per declared set; a pool with no sets still needs `max_sets >= 1`.
    pub max_sets: u32,
}

impl PoolPlan {
    pub fn for_sets(sets: &[SetLayout]) -> Self {
        let count = |kind: DescriptorKind| {
            sets.iter()
                .flatten()
                .filter(|b| b.kind == kind)
                .count() as u32
        };

        let sizes = [DescriptorKind::Uniform, DescriptorKind::Storage]
            .into_iter()
            .map(|kind| vk::DescriptorPoolSize {
                ty: kind.descriptor_type(),
                descriptor_count: count(kind),
            })
            .filter(|size| size.descriptor_count > 0)
            .collect();

        Self {
            sizes,
            max_sets: sets.len().max(1) as u32,
        }
    }
}

/// Find `set`/`binding` among the declared layouts and check it takes `kind`.
pub fn check_binding(
    sets: &[SetLayout],
    set: u32,
    binding: u32,
    kind: DescriptorKind,
) -> GpuResult<()> {
    let bindings = sets.get(set as usize).ok_or(GpuError::SetOutOfRange {
        set,
        count: sets.len(),
    })?;

    let declared = bindings
        .iter()
        .find(|b| b.binding == binding)
        .ok_or(GpuError::UndeclaredBinding { set, binding })?;

    if declared.kind != kind {
        return Err(GpuError::DescriptorKindMismatch {
            set,
            binding,
            declared: declared.kind,
            found: kind,
        });
    }
    Ok(())
}

/// Device limits a buffer descriptor of one kind must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeLimits {
    pub offset_alignment: vk::DeviceSize,
    pub max_range: vk::DeviceSize,
}

impl RangeLimits {
    pub fn for_kind(limits: &vk::PhysicalDeviceLimits, kind: DescriptorKind) -> Self {
        match kind {
            DescriptorKind::Uniform => Self {
                offset_alignment: limits.min_uniform_buffer_offset_alignment,
                max_range: limits.max_uniform_buffer_range.into(),
            },
            DescriptorKind::Storage => Self {
                offset_alignment: limits.min_storage_buffer_offset_alignment,
                max_range: limits.max_storage_buffer_range.into(),
            },
        }
    }
}

/// `offset..offset + range` must be a non-empty, aligned span inside a
/// buffer created with `size` bytes. `vk::WHOLE_SIZE` means "to the end".
pub fn check_range(
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
    size: vk::DeviceSize,
    limits: RangeLimits,
) -> GpuResult<()> {
    let span = if range == vk::WHOLE_SIZE {
        size.checked_sub(offset)
    } else {
        offset
            .checked_add(range)
            .filter(|&end| end <= size)
            .map(|_| range)
    };

    let aligned = limits.offset_alignment == 0 || offset % limits.offset_alignment == 0;
    match span {
        Some(span) if span > 0 && span <= limits.max_range && aligned => Ok(()),
        _ => Err(GpuError::RangeOutOfBounds { offset, range, size }),
    }
}

pub struct ComputePipeline {
    bindings: Vec<SetLayout>,
    descriptor_pool: vk::DescriptorPool,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    descriptor_sets: Vec<vk::DescriptorSet>,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    command_pool: vk::CommandPool,
    device: Arc<Device>,
}

impl ComputePipeline {
    /// Build the pipeline for `shader` with one descriptor set per entry of `sets`.
    ///
    /// On failure, every handle created so far is destroyed before returning.
    pub fn new(device: Arc<Device>, shader: &Shader, sets: &[SetLayout]) -> GpuResult<Arc<Self>> {
        if shader.stage() != vk::ShaderStageFlags::COMPUTE {
            return Err(GpuError::UnsupportedStage(shader.stage()));
        }

        let mut this = Self {
            bindings: sets.to_vec(),
            descriptor_pool: vk::DescriptorPool::null(),
            set_layouts: Vec::with_capacity(sets.len()),
            descriptor_sets: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            command_pool: vk::CommandPool::null(),
            device,
        };

        this.init_descriptors(sets)?;
        this.init_pipeline(shader)?;
        this.init_command_pool()?;

        log::info!(
            "Pipeline ready ({} descriptor set(s), {} binding(s))",
            sets.len(),
            sets.iter().map(Vec::len).sum::<usize>()
        );
        Ok(Arc::new(this))
    }

    fn init_descriptors(&mut self, sets: &[SetLayout]) -> GpuResult<()> {
        let device = &self.device.device;

        // Pool sized for exactly the declared bindings, before any layout or set
        let plan = PoolPlan::for_sets(sets);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(plan.max_sets)
            .pool_sizes(&plan.sizes);

        self.descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(GpuError::vk("create descriptor pool"))?;
        log::debug!("Descriptor pool: {:?}", plan);

        // One layout per set, in input order
        for bindings in sets {
            let layout_bindings: Vec<_> = bindings
                .iter()
                .map(|b| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(b.binding)
                        .descriptor_type(b.kind.descriptor_type())
                        .descriptor_count(1)
                        .stage_flags(vk::ShaderStageFlags::COMPUTE)
                        .build()
                })
                .collect();

            let layout_info =
                vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);

            let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
                .map_err(GpuError::vk("create descriptor set layout"))?;
            self.set_layouts.push(layout);
        }

        // All sets in one allocation
        if !self.set_layouts.is_empty() {
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(self.descriptor_pool)
                .set_layouts(&self.set_layouts);

            self.descriptor_sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
                .map_err(GpuError::vk("allocate descriptor sets"))?;
        }

        Ok(())
    }

    fn init_pipeline(&mut self, shader: &Shader) -> GpuResult<()> {
        let device = &self.device.device;

        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&self.set_layouts);

        self.pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(GpuError::vk("create pipeline layout"))?;

        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module())
            .name(ENTRY_POINT)
            .build();

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(self.pipeline_layout)
            .build();

        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| e)
        .map_err(GpuError::vk("create compute pipeline"))?;

        self.pipeline = pipelines[0];
        Ok(())
    }

    fn init_command_pool(&mut self) -> GpuResult<()> {
        // Commands are recorded once and never reset individually
        let pool_info =
            vk::CommandPoolCreateInfo::builder().queue_family_index(self.device.queue_family_index);

        self.command_pool = unsafe { self.device.device.create_command_pool(&pool_info, None) }
            .map_err(GpuError::vk("create command pool"))?;
        Ok(())
    }

    /// Point `set`/`binding` at `buffer[offset..offset + range]`.
    ///
    /// The descriptor type always comes from the buffer and must match the
    /// declared binding. Must not race with a submission that reads this set.
    pub fn feed_buffer(
        &self,
        set: u32,
        binding: u32,
        buffer: &Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> GpuResult<()> {
        check_binding(&self.bindings, set, binding, buffer.descriptor_kind())?;
        let limits = RangeLimits::for_kind(&self.device.properties.limits, buffer.descriptor_kind());
        check_range(offset, range, buffer.requested_size(), limits)?;
        let dst_set = *self
            .descriptor_sets
            .get(set as usize)
            .ok_or(GpuError::SetOutOfRange {
                set,
                count: self.descriptor_sets.len(),
            })?;

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: buffer.raw(),
            offset,
            range,
        }];

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(dst_set)
            .dst_binding(binding)
            .descriptor_type(buffer.descriptor_kind().descriptor_type())
            .buffer_info(&buffer_info)
            .build();

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
        log::debug!(
            "Fed {:?} buffer into set {} binding {} ({} bytes at {})",
            buffer.descriptor_kind(),
            set,
            binding,
            range,
            offset
        );
        Ok(())
    }

    /// Record a dispatch over `groups` (0 to 3 workgroup counts).
    pub fn create_command(self: &Arc<Self>, groups: &[u32]) -> GpuResult<Command> {
        let workgroups = Workgroups::from_counts(groups)?;
        Command::new(Arc::clone(self), workgroups)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.set_layouts
    }

    pub fn descriptor_sets(&self) -> &[vk::DescriptorSet] {
        &self.descriptor_sets
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        log::debug!("Destroying compute pipeline");
        let device = &self.device.device;

        // Destroy in reverse order of creation!
        unsafe {
            device.destroy_command_pool(self.command_pool, None);

            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);

            if !self.descriptor_sets.is_empty() {
                if let Err(e) =
                    device.free_descriptor_sets(self.descriptor_pool, &self.descriptor_sets)
                {
                    log::warn!("Failed to free descriptor sets: {}", e);
                }
            }
            for &layout in self.set_layouts.iter().rev() {
                device.destroy_descriptor_set_layout(layout, None);
            }
            device.destroy_descriptor_pool(self.descriptor_pool, None);
        }
    }
}
