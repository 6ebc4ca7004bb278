//! Convenience wrappers for locating an OpenCL platform and device and
//! setting up a context with a command queue.

use log::info;
use ocl::{Context, Device, Platform, Queue};

use crate::error::Result;

/// A ready-to-use OpenCL environment.
pub struct ClHandles {
    pub platform: Platform,
    pub device: Device,
    pub context: Context,
    pub queue: Queue,
}

impl ClHandles {
    /// Set up the default platform's first device.
    pub fn new() -> Result<Self> {
        Self::with_selection(None, None)
    }

    /// Set up a specific platform (substring match on its name) and device
    /// index. `None` selects the defaults.
    pub fn with_selection(platform_name: Option<&str>, device_index: Option<usize>) -> Result<Self> {
        let platform = find_platform(platform_name).ok_or_else(|| {
            crate::Error::Config(format!(
                "no OpenCL platform matching {:?}",
                platform_name.unwrap_or("<default>")
            ))
        })?;
        let device = find_device(&platform, device_index)?;
        info!(
            "using device {} on platform {}",
            device.name().unwrap_or_else(|_| "<unknown>".into()),
            platform.name().unwrap_or_else(|_| "<unknown>".into()),
        );

        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()?;
        let queue = Queue::new(&context, device, None)?;

        Ok(ClHandles {
            platform,
            device,
            context,
            queue,
        })
    }
}

/// Find a platform whose name contains `selector`, or the default platform.
pub fn find_platform(selector: Option<&str>) -> Option<Platform> {
    match selector {
        None => Some(Platform::default()),
        Some(sel) => Platform::list()
            .into_iter()
            .find(|p| p.name().map(|name| name.contains(sel)).unwrap_or(false)),
    }
}

/// Find a device on the platform by index, or the first one.
pub fn find_device(platform: &Platform, index: Option<usize>) -> Result<Device> {
    let device = match index {
        None => Device::first(*platform)?,
        Some(idx) => Device::by_idx_wrap(*platform, idx)?,
    };
    Ok(device)
}

/// Check whether a usable compute device can be found.
pub fn self_test() -> bool {
    match ClHandles::new() {
        Ok(handles) => {
            info!(
                "self test found device: {}",
                handles.device.name().unwrap_or_else(|_| "<unknown>".into())
            );
            true
        }
        Err(err) => {
            info!("self test failed to find a usable device: {}", err);
            false
        }
    }
}
