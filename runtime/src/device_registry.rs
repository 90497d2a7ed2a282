use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendType {
    Cpu,
    Vulkan,
    Metal,
    DirectX,
    OpenGl,
    WebGPU,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Cpu => write!(f, "CPU"),
            BackendType::Vulkan => write!(f, "Vulkan"),
            BackendType::Metal => write!(f, "Metal"),
            BackendType::DirectX => write!(f, "DirectX"),
            BackendType::OpenGl => write!(f, "OpenGL"),
            BackendType::WebGPU => write!(f, "WebGPU"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub const CPU: DeviceId = DeviceId(0);
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub backend: BackendType,
    pub name: String,
    /// Worker threads for the CPU device, `1` for accelerators.
    pub compute_units: usize,
}

impl DeviceInfo {
    pub fn is_gpu(&self) -> bool {
        self.backend != BackendType::Cpu
    }

    /// Whether data-parallel back-ends are worth offering on this device.
    pub fn supports_parallel(&self) -> bool {
        self.is_gpu() || self.compute_units > 1
    }
}

/// Compute devices visible to this process and the one currently selected.
///
/// The CPU is always present. Accelerators are probed through wgpu when the
/// `gpu` feature is enabled; a failed or empty probe only means fewer devices.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Vec<DeviceInfo>,
    selected: DeviceId,
}

impl DeviceRegistry {
    pub fn probe() -> Self {
        let mut registry = Self::cpu_only(crate::env::available_cpu_threads());
        for gpu in probe_gpus(1) {
            tracing::info!(id = %gpu.id, backend = %gpu.backend, name = %gpu.name, "found compute device");
            registry.devices.push(gpu);
        }
        registry
    }

    pub fn cpu_only(threads: usize) -> Self {
        Self {
            devices: vec![DeviceInfo {
                id: DeviceId::CPU,
                backend: BackendType::Cpu,
                name: "CPU".to_string(),
                compute_units: threads.max(1),
            }],
            selected: DeviceId::CPU,
        }
    }

    pub fn register(&mut self, device: DeviceInfo) {
        self.devices.retain(|d| d.id != device.id);
        self.devices.push(device);
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Select `id`; unknown ids leave the selection unchanged.
    pub fn select(&mut self, id: DeviceId) -> bool {
        if self.get(id).is_some() {
            self.selected = id;
            true
        } else {
            tracing::warn!(%id, "ignoring selection of unknown compute device");
            false
        }
    }

    pub fn selected(&self) -> &DeviceInfo {
        self.get(self.selected)
            .unwrap_or(&self.devices[0])
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::probe()
    }
}

#[cfg(feature = "gpu")]
fn probe_gpus(first_id: u32) -> Vec<DeviceInfo> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .map(|adapter| adapter.get_info())
        .filter(|info| info.device_type != wgpu::DeviceType::Cpu)
        .enumerate()
        .map(|(i, info)| DeviceInfo {
            id: DeviceId(first_id + i as u32),
            backend: match info.backend {
                wgpu::Backend::Vulkan => BackendType::Vulkan,
                wgpu::Backend::Metal => BackendType::Metal,
                wgpu::Backend::Dx12 => BackendType::DirectX,
                wgpu::Backend::Gl => BackendType::OpenGl,
                _ => BackendType::WebGPU,
            },
            name: info.name,
            compute_units: 1,
        })
        .collect()
}

#[cfg(not(feature = "gpu"))]
fn probe_gpus(_first_id: u32) -> Vec<DeviceInfo> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_is_always_present_and_selected() {
        let registry = DeviceRegistry::probe();
        assert_eq!(registry.devices()[0].id, DeviceId::CPU);
        assert_eq!(registry.selected().backend, BackendType::Cpu);
    }

    #[test]
    fn unknown_device_is_not_selected() {
        let mut registry = DeviceRegistry::cpu_only(4);
        assert!(!registry.select(DeviceId(42)));
        assert_eq!(registry.selected().id, DeviceId::CPU);
    }

    #[test]
    fn registered_gpu_can_be_selected() {
        let mut registry = DeviceRegistry::cpu_only(1);
        assert!(!registry.selected().supports_parallel());
        registry.register(DeviceInfo {
            id: DeviceId(7),
            backend: BackendType::Vulkan,
            name: "test adapter".into(),
            compute_units: 1,
        });
        assert!(registry.select(DeviceId(7)));
        assert!(registry.selected().supports_parallel());
        assert_eq!(registry.get(DeviceId(7)).map(|d| d.is_gpu()), Some(true));
    }
}
