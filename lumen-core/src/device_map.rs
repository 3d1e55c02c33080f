use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            tracing::warn!(
                "no accelerator available, running on CPU; build with `--features cuda` or `--features metal` for GPU support"
            );
            Ok(Device::Cpu)
        }
    }
}

/// Device name reported in HTTP responses for what this map resolves to.
pub fn device_label(device_map: DeviceMap) -> &'static str {
    match device_map {
        DeviceMap::ForceCpu => "cpu",
        DeviceMap::Ordinal(_) if cuda_is_available() => "cuda",
        DeviceMap::Ordinal(_) if metal_is_available() => "metal",
        DeviceMap::Ordinal(_) => "cpu",
    }
}

pub fn cuda_available() -> bool {
    cuda_is_available()
}
