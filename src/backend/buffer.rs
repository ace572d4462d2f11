// GPU buffers for descriptor bindings
//
// A Buffer owns one VkBuffer plus the device memory bound to it, and knows
// which descriptor kind it is bound as. Host access is map-copy-unmap.

use ash::vk;
use std::sync::Arc;

use super::device::Device;
use super::error::{GpuError, GpuResult};

/// How a buffer is exposed to a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Uniform,
    Storage,
}

impl DescriptorKind {
    /// Derive the kind from the exact usage a buffer was created with.
    pub fn from_usage(usage: vk::BufferUsageFlags) -> GpuResult<Self> {
        if usage == vk::BufferUsageFlags::UNIFORM_BUFFER {
            Ok(Self::Uniform)
        } else if usage == vk::BufferUsageFlags::STORAGE_BUFFER {
            Ok(Self::Storage)
        } else {
            Err(GpuError::UnsupportedUsage(usage))
        }
    }

    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::Uniform => vk::DescriptorType::UNIFORM_BUFFER,
            Self::Storage => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// Device memory region bound to a buffer handle.
pub struct Buffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    /// Size reported by the driver's memory requirements, >= requested size.
    size: vk::DeviceSize,
    requested_size: vk::DeviceSize,
    memory_flags: vk::MemoryPropertyFlags,
    kind: DescriptorKind,
    device: Arc<Device>,
}

impl Buffer {
    /// Create a buffer and bind freshly allocated memory to it at offset 0.
    ///
    /// `usage` must be exactly `UNIFORM_BUFFER` or `STORAGE_BUFFER`; the memory
    /// type is the first one allowed by the buffer whose flags contain
    /// `memory_properties`.
    pub fn new(
        device: Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> GpuResult<Self> {
        let kind = DescriptorKind::from_usage(usage)?;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .map_err(GpuError::vk("create buffer"))?;

        // Dropping `this` on any failure below releases the buffer handle.
        let mut this = Self {
            buffer,
            memory: vk::DeviceMemory::null(),
            size: 0,
            requested_size: size,
            memory_flags: vk::MemoryPropertyFlags::empty(),
            kind,
            device,
        };

        let requirements = unsafe { this.device.device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = find_memory_type(
            &this.device.memory_properties,
            requirements.memory_type_bits,
            memory_properties,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        this.memory = unsafe { this.device.device.allocate_memory(&alloc_info, None) }
            .map_err(GpuError::vk("allocate buffer memory"))?;
        this.size = requirements.size;
        this.memory_flags = this.device.memory_properties.memory_types
            [memory_type_index as usize]
            .property_flags;

        unsafe { this.device.device.bind_buffer_memory(buffer, this.memory, 0) }
            .map_err(GpuError::vk("bind buffer memory"))?;

        log::debug!(
            "Created {:?} buffer: requested {} bytes, allocated {} (memory type {})",
            kind,
            size,
            this.size,
            memory_type_index
        );
        Ok(this)
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn descriptor_kind(&self) -> DescriptorKind {
        self.kind
    }

    /// Capacity of the bound memory.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn requested_size(&self) -> vk::DeviceSize {
        self.requested_size
    }

    /// Copy `src` into the buffer, truncated to its capacity.
    ///
    /// The caller must ensure no GPU work touching this buffer is in flight.
    pub fn update(&self, src: &[u8]) -> GpuResult<usize> {
        let len = copy_len(src.len(), self.size);
        self.with_mapped(Access::Write, |ptr| unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr, len);
        })?;
        Ok(len)
    }

    /// Copy the buffer's contents into `dst`, truncated to its capacity.
    ///
    /// The caller must ensure no GPU work touching this buffer is in flight.
    pub fn dump(&self, dst: &mut [u8]) -> GpuResult<usize> {
        let len = copy_len(dst.len(), self.size);
        self.with_mapped(Access::Read, |ptr| unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, dst.as_mut_ptr(), len);
        })?;
        Ok(len)
    }

    /// Buffer contents read back as 32-bit unsigned integers.
    pub fn words(&self) -> GpuResult<Vec<u32>> {
        let mut bytes = vec![0u8; copy_len(usize::MAX, self.size)];
        self.dump(&mut bytes)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
            .collect())
    }

    /// Debug dump of the contents as `u32`s.
    pub fn print(&self) -> GpuResult<()> {
        let line = self
            .words()?
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        log::info!("{}", line);
        Ok(())
    }

    /// Map the whole allocation, run `f`, unmap.
    ///
    /// Non-coherent memory is invalidated before a read and flushed after a
    /// write while still mapped.
    fn with_mapped(&self, access: Access, f: impl FnOnce(*mut u8)) -> GpuResult<()> {
        if !self
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(GpuError::NotHostVisible);
        }

        let device = &self.device.device;
        let coherent = self
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        let range = vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();

        unsafe {
            let ptr = device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .map_err(GpuError::vk("map buffer memory"))?;

            let result = match access {
                Access::Read if !coherent => device
                    .invalidate_mapped_memory_ranges(&[range])
                    .map_err(GpuError::vk("invalidate buffer memory")),
                _ => Ok(()),
            };
            if result.is_ok() {
                f(ptr as *mut u8);
            }
            let result = match access {
                Access::Write if !coherent && result.is_ok() => device
                    .flush_mapped_memory_ranges(&[range])
                    .map_err(GpuError::vk("flush buffer memory")),
                _ => result,
            };

            device.unmap_memory(self.memory);
            result
        }
    }
}

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
}

impl Drop for Buffer {
    fn drop(&mut self) {
        log::debug!("Destroying {:?} buffer ({} bytes)", self.kind, self.size);
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Number of bytes a host copy moves: never past the buffer's capacity.
pub fn copy_len(requested: usize, capacity: vk::DeviceSize) -> usize {
    requested.min(usize::try_from(capacity).unwrap_or(usize::MAX))
}

/// Find the first memory type allowed by `type_filter` whose flags contain
/// all of `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> GpuResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let has_type = (type_filter & (1 << i)) != 0;
            let has_properties = memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties);
            has_type && has_properties
        })
        .ok_or(GpuError::NoCompatibleMemoryType {
            type_bits: type_filter,
            required: properties,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        props
    }

    #[test]
    fn descriptor_kind_from_exact_usage() {
        assert_eq!(
            DescriptorKind::from_usage(vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap(),
            DescriptorKind::Uniform
        );
        assert_eq!(
            DescriptorKind::from_usage(vk::BufferUsageFlags::STORAGE_BUFFER).unwrap(),
            DescriptorKind::Storage
        );
    }

    #[test]
    fn other_usages_are_rejected() {
        for usage in [
            vk::BufferUsageFlags::empty(),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
        ] {
            let err = DescriptorKind::from_usage(usage).unwrap_err();
            assert!(matches!(err, GpuError::UnsupportedUsage(u) if u == usage));
        }
    }

    #[test]
    fn descriptor_kind_maps_to_vk_type() {
        assert_eq!(
            DescriptorKind::Uniform.descriptor_type(),
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert_eq!(
            DescriptorKind::Storage.descriptor_type(),
            vk::DescriptorType::STORAGE_BUFFER
        );
    }

    #[test]
    fn memory_type_respects_filter_and_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        // First superset match wins
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap(),
            1
        );
        // Filter excludes type 1
        assert_eq!(
            find_memory_type(&props, 0b101, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap(),
            2
        );
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::empty()).unwrap(),
            0
        );
    }

    #[test]
    fn memory_type_selection_fails_without_match() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        assert!(matches!(
            err,
            GpuError::NoCompatibleMemoryType { type_bits: 0b1, .. }
        ));

        // Bits beyond memory_type_count are never considered
        let err = find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::empty()).unwrap_err();
        assert!(matches!(err, GpuError::NoCompatibleMemoryType { .. }));
    }

    #[test]
    fn copies_are_clamped_to_capacity() {
        assert_eq!(copy_len(16, 64), 16);
        assert_eq!(copy_len(64, 64), 64);
        assert_eq!(copy_len(100, 64), 64);
        assert_eq!(copy_len(0, 64), 0);
    }
}
