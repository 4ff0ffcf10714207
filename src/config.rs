//! Static VM and device configuration.
//!
//! Defaults come from [`crate::platform`]; the embedding VMM overrides
//! fields and calls `validate()` before building a [`crate::vm::Vm`].

use crate::devices::gic::GicVersion;
use crate::error::ConfigError;
use crate::platform;

/// Interrupt controller layout for one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub gic_version: GicVersion,
    pub num_vcpus: usize,
    pub gicd_base: u64,
    /// Only used with GICv3
    pub gicr_base: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            gic_version: platform::DEFAULT_GIC_VERSION,
            num_vcpus: platform::DEFAULT_NUM_VCPUS,
            gicd_base: platform::GICD_BASE,
            gicr_base: platform::GICR_BASE,
        }
    }
}

impl VmConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_vcpus == 0 || self.num_vcpus > platform::MAX_VCPUS {
            return Err(ConfigError::VcpuCount(self.num_vcpus));
        }
        check_aligned(self.gicd_base)?;
        if self.gic_version == GicVersion::V3 {
            check_aligned(self.gicr_base)?;
        }
        Ok(())
    }
}

/// How a virtio device is exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// virtio-mmio register window at `base`
    Mmio { base: u64 },
    /// virtio-pci BAR0 at `bar_base`; config space is handled elsewhere
    Pci { bar_base: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkDeviceConfig {
    pub transport: Transport,
    pub virq: u32,
    /// vCPU that receives completion interrupts
    pub vcpu: usize,
    /// Channel shared with the storage backend
    pub backend_channel: u32,
}

impl Default for BlkDeviceConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Mmio { base: platform::VIRTIO_MMIO_BASE },
            virq: platform::VIRTIO_BLK_VIRQ,
            vcpu: 0,
            backend_channel: platform::BLK_BACKEND_CHANNEL,
        }
    }
}

impl BlkDeviceConfig {
    pub fn validate(&self, vm: &VmConfig) -> Result<(), ConfigError> {
        // Device interrupts are SPIs; the GIC reserves 1020..1023.
        if self.virq < 32 || self.virq >= 1020 {
            return Err(ConfigError::Virq(self.virq));
        }
        if self.vcpu >= vm.num_vcpus {
            return Err(ConfigError::VcpuCount(self.vcpu));
        }
        match self.transport {
            Transport::Mmio { base } => {
                // virtio-mmio windows only need 512-byte alignment
                if base % platform::VIRTIO_MMIO_SIZE != 0 {
                    return Err(ConfigError::Misaligned(base));
                }
            }
            Transport::Pci { bar_base } => check_aligned(bar_base)?,
        }
        Ok(())
    }
}

fn check_aligned(addr: u64) -> Result<(), ConfigError> {
    if addr % platform::PAGE_SIZE != 0 {
        return Err(ConfigError::Misaligned(addr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let vm = VmConfig::default();
        assert_eq!(vm.validate(), Ok(()));
        assert_eq!(BlkDeviceConfig::default().validate(&vm), Ok(()));
    }

    #[test]
    fn test_rejects_bad_values() {
        let vm = VmConfig { num_vcpus: 0, ..VmConfig::default() };
        assert_eq!(vm.validate(), Err(ConfigError::VcpuCount(0)));

        let vm = VmConfig::default();
        let blk = BlkDeviceConfig { virq: 27, ..BlkDeviceConfig::default() };
        assert_eq!(blk.validate(&vm), Err(ConfigError::Virq(27)));

        let blk = BlkDeviceConfig {
            transport: Transport::Pci { bar_base: 0x1000_0800 },
            ..BlkDeviceConfig::default()
        };
        assert_eq!(blk.validate(&vm), Err(ConfigError::Misaligned(0x1000_0800)));
    }
}
