use std::fmt;

// Context — Where an array's storage lives
//
// A (device kind, device id) pair fixed when the array is created.
// The numeric kinds match the device masks used by the serialization
// format: 1 = cpu, 2 = gpu. Kind 0 is the "zero context" reported for
// none-state arrays.

/// Class of device an array lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceKind {
    /// No device, reported for none-state arrays.
    #[default]
    Unset,
    Cpu,
    Gpu,
}

impl DeviceKind {
    /// Numeric device mask.
    pub fn mask(self) -> i32 {
        match self {
            DeviceKind::Unset => 0,
            DeviceKind::Cpu => 1,
            DeviceKind::Gpu => 2,
        }
    }

    /// Inverse of [`DeviceKind::mask`].
    pub fn from_mask(mask: i32) -> crate::Result<Self> {
        match mask {
            0 => Ok(DeviceKind::Unset),
            1 => Ok(DeviceKind::Cpu),
            2 => Ok(DeviceKind::Gpu),
            other => Err(crate::Error::format(format!("unknown device mask {other}"))),
        }
    }
}

/// Device class + device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Context {
    pub kind: DeviceKind,
    pub id: u32,
}

impl Context {
    pub fn new(kind: DeviceKind, id: u32) -> Self {
        Context { kind, id }
    }

    /// Host memory.
    pub fn cpu() -> Self {
        Context::new(DeviceKind::Cpu, 0)
    }

    pub fn gpu(id: u32) -> Self {
        Context::new(DeviceKind::Gpu, id)
    }

    /// Whether raw data of arrays on this context can be handed out as host memory.
    pub fn is_host(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Unset => write!(f, "none"),
            DeviceKind::Cpu => write!(f, "cpu({})", self.id),
            DeviceKind::Gpu => write!(f, "gpu({})", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_zero_context() {
        let ctx = Context::default();
        assert_eq!(ctx.kind.mask(), 0);
        assert_eq!(ctx.id, 0);
        assert!(!ctx.is_host());
    }

    #[test]
    fn test_mask_roundtrip() {
        for kind in [DeviceKind::Unset, DeviceKind::Cpu, DeviceKind::Gpu] {
            assert_eq!(DeviceKind::from_mask(kind.mask()).unwrap(), kind);
        }
        assert!(DeviceKind::from_mask(7).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Context::cpu().to_string(), "cpu(0)");
        assert_eq!(Context::gpu(3).to_string(), "gpu(3)");
    }
}
